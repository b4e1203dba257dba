//! In-process platform pair for a master and remote in one address space.
//!
//! Each side keeps an ISR table. `notify` on one side raises the line at the
//! other. A line with no ISR registered yet stays latched, like a mailbox
//! flag, and fires once one is.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rpmsg_core::{Isr, Platform, RpmsgError};

/// When a raised notification reaches the peer's ISR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// On the notifying thread, before `notify` returns.
    #[default]
    Immediate,
    /// Latched until the receiving side calls
    /// [`deliver_pending`](LoopbackPlatform::deliver_pending).
    Deferred,
}

#[derive(Default)]
struct Lines {
    isrs: HashMap<u32, Weak<dyn Isr>>,
    pending: BTreeSet<u32>,
}

/// One side of a loopback pair.
pub struct LoopbackPlatform {
    delivery: Delivery,
    lines: Mutex<Lines>,
    peer: Mutex<Weak<LoopbackPlatform>>,
}

impl LoopbackPlatform {
    /// Two platforms wired to each other.
    pub fn pair(delivery: Delivery) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(delivery));
        let b = Arc::new(Self::new(delivery));
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            lines: Mutex::new(Lines::default()),
            peer: Mutex::new(Weak::new()),
        }
    }

    #[inline]
    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Run the ISRs of every latched line that has one.
    ///
    /// Returns how many notifications were delivered.
    pub fn deliver_pending(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = {
                let mut lines = self.lines.lock();
                let ready = lines
                    .pending
                    .iter()
                    .copied()
                    .find(|id| lines.isrs.contains_key(id));
                ready.map(|id| {
                    lines.pending.remove(&id);
                    (id, lines.isrs.get(&id).cloned())
                })
            };
            let Some((vq_id, isr)) = next else {
                return delivered;
            };
            if let Some(isr) = isr.and_then(|w| w.upgrade()) {
                isr.on_notify(vq_id);
                delivered += 1;
            }
        }
    }

    /// Lines raised and not yet delivered.
    pub fn pending(&self) -> Vec<u32> {
        self.lines.lock().pending.iter().copied().collect()
    }

    /// The peer raised `vq_id` at us.
    fn raise(&self, vq_id: u32) {
        let isr = {
            let mut lines = self.lines.lock();
            let registered = match self.delivery {
                Delivery::Immediate => lines.isrs.get(&vq_id).cloned(),
                Delivery::Deferred => None,
            };
            if registered.is_none() {
                lines.pending.insert(vq_id);
            }
            registered.and_then(|w| w.upgrade())
        };
        if let Some(isr) = isr {
            isr.on_notify(vq_id);
        }
    }
}

impl Platform for LoopbackPlatform {
    fn init_interrupt(&self, vq_id: u32, isr: Weak<dyn Isr>) -> Result<(), RpmsgError> {
        let latched = {
            let mut lines = self.lines.lock();
            if lines.isrs.contains_key(&vq_id) {
                return Err(RpmsgError::InvalidArgument(
                    "interrupt already registered for this virtqueue",
                ));
            }
            lines.isrs.insert(vq_id, isr.clone());
            self.delivery == Delivery::Immediate && lines.pending.remove(&vq_id)
        };
        if latched {
            if let Some(isr) = isr.upgrade() {
                isr.on_notify(vq_id);
            }
        }
        Ok(())
    }

    fn deinit_interrupt(&self, vq_id: u32) -> Result<(), RpmsgError> {
        let mut lines = self.lines.lock();
        lines.pending.remove(&vq_id);
        match lines.isrs.remove(&vq_id) {
            Some(_) => Ok(()),
            None => Err(RpmsgError::InvalidArgument(
                "no interrupt registered for this virtqueue",
            )),
        }
    }

    fn notify(&self, vq_id: u32) {
        let peer = self.peer.lock().upgrade();
        match peer {
            Some(peer) => peer.raise(vq_id),
            None => tracing::trace!(vq_id, "notify with no peer"),
        }
    }
}

impl std::fmt::Debug for LoopbackPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines = self.lines.lock();
        f.debug_struct("LoopbackPlatform")
            .field("delivery", &self.delivery)
            .field("registered", &lines.isrs.len())
            .field("pending", &lines.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl Isr for Counter {
        fn on_notify(&self, _vq_id: u32) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn weak(isr: &Arc<Counter>) -> Weak<dyn Isr> {
        let isr: Arc<dyn Isr> = isr.clone();
        Arc::downgrade(&isr)
    }

    #[test]
    fn test_immediate_delivery() {
        let (a, b) = LoopbackPlatform::pair(Delivery::Immediate);
        let isr = Arc::new(Counter::default());
        b.init_interrupt(3, weak(&isr)).unwrap();

        a.notify(3);
        assert_eq!(isr.hits.load(Ordering::Relaxed), 1);
        assert!(b.pending().is_empty());
    }

    #[test]
    fn test_latched_until_registered() {
        let (a, b) = LoopbackPlatform::pair(Delivery::Immediate);
        a.notify(0);
        a.notify(0);
        assert_eq!(b.pending(), vec![0]);

        let isr = Arc::new(Counter::default());
        b.init_interrupt(0, weak(&isr)).unwrap();
        assert_eq!(isr.hits.load(Ordering::Relaxed), 1);
        assert!(b.pending().is_empty());
    }

    #[test]
    fn test_deferred_delivery() {
        let (a, b) = LoopbackPlatform::pair(Delivery::Deferred);
        let isr = Arc::new(Counter::default());
        b.init_interrupt(1, weak(&isr)).unwrap();

        a.notify(1);
        a.notify(7);
        assert_eq!(isr.hits.load(Ordering::Relaxed), 0);
        assert_eq!(b.deliver_pending(), 1);
        assert_eq!(isr.hits.load(Ordering::Relaxed), 1);
        // Line 7 has no ISR and stays latched.
        assert_eq!(b.pending(), vec![7]);
    }

    #[test]
    fn test_double_registration_rejected() {
        let (_a, b) = LoopbackPlatform::pair(Delivery::Immediate);
        let isr = Arc::new(Counter::default());
        b.init_interrupt(0, weak(&isr)).unwrap();
        assert!(b.init_interrupt(0, weak(&isr)).is_err());
        b.deinit_interrupt(0).unwrap();
        assert!(b.deinit_interrupt(0).is_err());
    }
}
