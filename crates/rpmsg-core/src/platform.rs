//! Capabilities the transport consumes from its platform.
//!
//! The transport never touches interrupt controllers, mailboxes or OS
//! primitives directly. A [`Platform`] raises notifications at the peer,
//! routes the peer's notifications to registered [`Isr`]s, fences memory and
//! sleeps.

use std::sync::atomic::{fence, Ordering};
use std::sync::Weak;
use std::time::Duration;

use crate::RpmsgError;

/// Receiver of notifications for one virtqueue.
///
/// Called from whatever context the platform delivers notifications in: an
/// interrupt handler, a dedicated task, or the thread that raised them.
pub trait Isr: Send + Sync {
    fn on_notify(&self, vq_id: u32);
}

/// Platform services for one side of a link.
pub trait Platform: Send + Sync + 'static {
    /// Route notifications for `vq_id` to `isr`.
    ///
    /// The platform holds the handler weakly; once the owning instance is gone
    /// notifications are dropped.
    fn init_interrupt(&self, vq_id: u32, isr: Weak<dyn Isr>) -> Result<(), RpmsgError>;

    /// Stop routing notifications for `vq_id`.
    fn deinit_interrupt(&self, vq_id: u32) -> Result<(), RpmsgError>;

    /// Raise a notification at the peer for `vq_id`.
    fn notify(&self, vq_id: u32);

    /// Full memory barrier between this side and the peer.
    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    /// Sleep between polls of a blocking call.
    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    /// Largest link id this platform can route.
    fn highest_link_id(&self) -> u32 {
        u32::MAX >> 1
    }
}

/// Virtqueue id of `queue` (0 or 1) on `link_id`.
#[inline]
pub const fn vq_id(link_id: u32, queue: u32) -> u32 {
    (link_id << 1) | (queue & 1)
}

/// Link id a virtqueue id belongs to.
#[inline]
pub const fn link_id_of(vq_id: u32) -> u32 {
    vq_id >> 1
}

/// Vring index (0 or 1) a virtqueue id refers to.
#[inline]
pub const fn queue_of(vq_id: u32) -> u32 {
    vq_id & 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vq_id_packing() {
        assert_eq!(vq_id(0, 0), 0);
        assert_eq!(vq_id(0, 1), 1);
        assert_eq!(vq_id(3, 1), 7);
        assert_eq!(link_id_of(7), 3);
        assert_eq!(queue_of(7), 1);
        assert_eq!(queue_of(vq_id(5, 2)), 0);
    }
}
