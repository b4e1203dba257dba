//! Endpoint registry.
//!
//! Maps local addresses to message handlers. Mutations take the write lock;
//! dispatch clones the handler under the read lock and calls it after the
//! lock is gone, so a handler may create or destroy endpoints, or send.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rpmsg_core::{RpmsgError, ADDR_ANY};

use crate::buffer::RxBuffer;

/// Receives messages addressed to one endpoint.
///
/// Runs synchronously in the receive path. Dropping the buffer hands it back
/// to the peer right away; keeping it holds the buffer (zero-copy receive)
/// until it is released or dropped.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, msg: RxBuffer);
}

impl<F> MessageHandler for F
where
    F: Fn(RxBuffer) + Send + Sync + 'static,
{
    fn on_message(&self, msg: RxBuffer) {
        self(msg)
    }
}

/// Handle to a registered endpoint.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: u32,
    id: u64,
}

impl Endpoint {
    /// Local address of this endpoint.
    #[inline]
    pub fn addr(&self) -> u32 {
        self.addr
    }
}

struct Entry {
    id: u64,
    handler: Arc<dyn MessageHandler>,
}

/// Address -> handler map of one instance.
pub(crate) struct EndpointRegistry {
    entries: RwLock<BTreeMap<u32, Entry>>,
    next_id: AtomicU64,
    reserved: u32,
}

impl EndpointRegistry {
    pub fn new(reserved: u32) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            reserved,
        }
    }

    /// Bind `addr`, or the lowest free address at or above the reserved
    /// range when `addr` is [`ADDR_ANY`].
    pub fn create(
        &self,
        addr: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Endpoint, RpmsgError> {
        let mut entries = self.entries.write();

        let addr = if addr == ADDR_ANY {
            lowest_free(&entries, self.reserved).ok_or(RpmsgError::AddressSpaceExhausted)?
        } else if entries.contains_key(&addr) {
            return Err(RpmsgError::AddressInUse(addr));
        } else {
            addr
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(addr, Entry { id, handler });
        Ok(Endpoint { addr, id })
    }

    /// Unbind `ept`.
    pub fn destroy(&self, ept: &Endpoint) -> Result<(), RpmsgError> {
        let mut entries = self.entries.write();
        match entries.get(&ept.addr) {
            Some(entry) if entry.id == ept.id => {
                entries.remove(&ept.addr);
                Ok(())
            }
            _ => Err(RpmsgError::InvalidArgument("endpoint is not registered")),
        }
    }

    pub fn lookup(&self, addr: u32) -> Option<Arc<dyn MessageHandler>> {
        self.entries.read().get(&addr).map(|e| e.handler.clone())
    }

    /// Whether `ept` is still registered.
    pub fn contains(&self, ept: &Endpoint) -> bool {
        self.entries
            .read()
            .get(&ept.addr)
            .is_some_and(|e| e.id == ept.id)
    }

    /// Hand `msg` to the endpoint bound at its destination.
    ///
    /// With no such endpoint the message is dropped, which returns its buffer.
    pub fn dispatch(&self, msg: RxBuffer) -> Result<(), RpmsgError> {
        let dst = msg.dst();
        match self.lookup(dst) {
            Some(handler) => {
                handler.on_message(msg);
                Ok(())
            }
            None => Err(RpmsgError::Unreachable(dst)),
        }
    }

    /// Drop every endpoint.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn lowest_free(entries: &BTreeMap<u32, Entry>, reserved: u32) -> Option<u32> {
    let mut candidate = reserved;
    for addr in entries.range(reserved..).map(|(addr, _)| *addr) {
        if addr != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    (candidate != ADDR_ANY).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn MessageHandler> {
        Arc::new(|_msg: RxBuffer| {})
    }

    #[test]
    fn test_explicit_address() {
        let registry = EndpointRegistry::new(1024);
        let ept = registry.create(10, noop()).unwrap();
        assert_eq!(ept.addr(), 10);
        assert!(registry.lookup(10).is_some());
        assert!(registry.lookup(11).is_none());
    }

    #[test]
    fn test_address_in_use() {
        let registry = EndpointRegistry::new(1024);
        let _ept = registry.create(10, noop()).unwrap();
        assert!(matches!(
            registry.create(10, noop()),
            Err(RpmsgError::AddressInUse(10))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_auto_assign_lowest_free() {
        let registry = EndpointRegistry::new(1024);
        let a = registry.create(ADDR_ANY, noop()).unwrap();
        let b = registry.create(ADDR_ANY, noop()).unwrap();
        assert_eq!((a.addr(), b.addr()), (1024, 1025));

        // Explicit addresses below the reserved range do not matter.
        let _low = registry.create(5, noop()).unwrap();
        registry.destroy(&a).unwrap();
        let c = registry.create(ADDR_ANY, noop()).unwrap();
        assert_eq!(c.addr(), 1024);

        // Skip over an explicitly bound address in the range.
        let _explicit = registry.create(1026, noop()).unwrap();
        let d = registry.create(ADDR_ANY, noop()).unwrap();
        assert_eq!(d.addr(), 1027);
    }

    #[test]
    fn test_destroy_with_stale_handle() {
        let registry = EndpointRegistry::new(1024);
        let first = registry.create(42, noop()).unwrap();
        registry.destroy(&first).unwrap();
        let second = registry.create(42, noop()).unwrap();

        // The old handle must not unbind the new endpoint.
        assert!(registry.destroy(&first).is_err());
        assert!(registry.contains(&second));
    }

    #[test]
    fn test_top_of_address_space() {
        let registry = EndpointRegistry::new(ADDR_ANY - 1);
        let last = registry.create(ADDR_ANY, noop()).unwrap();
        assert_eq!(last.addr(), ADDR_ANY - 1);
        assert!(matches!(
            registry.create(ADDR_ANY, noop()),
            Err(RpmsgError::AddressSpaceExhausted)
        ));
    }
}
