//! Split virtqueues over a [`SharedMemory`] region.
//!
//! A virtqueue is one vring plus the indices only this side knows about.
//! The producer of each ring keeps its index in shared memory and is the
//! only writer of it; the consumer keeps its read position locally.
//!
//! Every index publish is preceded by a platform barrier so that the peer
//! never observes an index ahead of the entry it covers.

use std::sync::Arc;

use parking_lot::Mutex;
use rpmsg_core::Platform;

use crate::layout::{SharedMemory, VringLayout};

/// Descriptor continues in `next`.
pub const VRING_DESC_F_NEXT: u16 = 1;
/// Descriptor is device-writable.
pub const VRING_DESC_F_WRITE: u16 = 2;

/// A buffer taken off a vring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBuffer {
    /// Descriptor index.
    pub idx: u16,
    /// Address stored in the descriptor.
    pub addr: u64,
    /// Length reported with the buffer.
    pub len: u32,
}

/// Indices private to this side.
#[derive(Debug, Default)]
struct LocalIndices {
    /// Next descriptor to hand out while filling the ring at init.
    desc_head_idx: u16,
    /// Consumer position in the used ring.
    used_cons_idx: u16,
    /// Consumer position in the avail ring.
    available_idx: u16,
    /// Buffers published since the last kick.
    queued: u16,
}

/// One direction of a link.
pub struct Virtqueue {
    id: u32,
    name: &'static str,
    shm: Arc<SharedMemory>,
    ring: VringLayout,
    platform: Arc<dyn Platform>,
    local: Mutex<LocalIndices>,
}

impl Virtqueue {
    /// Create a view of the vring described by `ring`.
    ///
    /// Does not touch shared memory; see [`Virtqueue::reset`].
    pub fn new(
        id: u32,
        name: &'static str,
        shm: Arc<SharedMemory>,
        ring: VringLayout,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            id,
            name,
            shm,
            ring,
            platform,
            local: Mutex::new(LocalIndices::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn num(&self) -> u16 {
        self.ring.num
    }

    #[inline]
    fn mask(&self) -> u16 {
        self.ring.num - 1
    }

    /// Zero the whole vring and local indices.
    ///
    /// # Safety
    ///
    /// The peer must not be using the vring.
    pub unsafe fn reset(&self) {
        // SAFETY: forwarded from the caller.
        unsafe { self.shm.zero(self.ring.desc, self.ring.span()) };
        *self.local.lock() = LocalIndices::default();
    }

    // -------------------------------------------------------------------------
    // Descriptor table
    // -------------------------------------------------------------------------

    fn write_desc(&self, idx: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let at = self.ring.desc(idx);
        self.shm.store_u32(at, addr as u32);
        self.shm.store_u32(at + 4, (addr >> 32) as u32);
        self.shm.store_u32(at + 8, len);
        self.shm.store_u16(at + 12, flags);
        self.shm.store_u16(at + 14, next);
    }

    fn read_desc(&self, idx: u16) -> (u64, u32) {
        let at = self.ring.desc(idx);
        let lo = self.shm.load_u32(at) as u64;
        let hi = self.shm.load_u32(at + 4) as u64;
        (lo | (hi << 32), self.shm.load_u32(at + 8))
    }

    fn check_idx(&self, idx: u16) -> Result<(), VringError> {
        if idx >= self.ring.num {
            return Err(VringError::IndexOutOfRange {
                idx,
                num: self.ring.num,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Producer side
    // -------------------------------------------------------------------------

    fn update_avail(&self, local: &mut LocalIndices, desc_idx: u16) {
        let avail_idx = self.shm.load_u16(self.ring.avail_idx());
        self.shm
            .store_u16(self.ring.avail_ring(avail_idx & self.mask()), desc_idx);
        self.platform.barrier();
        self.shm
            .store_u16(self.ring.avail_idx(), avail_idx.wrapping_add(1));
        local.queued = local.queued.wrapping_add(1);
    }

    fn update_used(&self, local: &mut LocalIndices, desc_idx: u16, len: u32) {
        let used_idx = self.shm.load_u16(self.ring.used_idx());
        let elem = self.ring.used_elem(used_idx & self.mask());
        self.shm.store_u32(elem, desc_idx as u32);
        self.shm.store_u32(elem + 4, len);
        self.platform.barrier();
        self.shm
            .store_u16(self.ring.used_idx(), used_idx.wrapping_add(1));
        local.queued = local.queued.wrapping_add(1);
    }

    /// Describe the next unused descriptor as `addr`/`len` and publish it on
    /// the avail ring. Master init only.
    pub fn fill_avail_buffers(&self, addr: u64, len: u32) -> Result<u16, VringError> {
        let mut local = self.local.lock();
        let head = local.desc_head_idx;
        self.check_idx(head).map_err(|_| VringError::DescriptorsExhausted)?;

        self.write_desc(head, addr, len, VRING_DESC_F_WRITE, 0);
        local.desc_head_idx += 1;
        self.update_avail(&mut local, head);
        Ok(head)
    }

    /// Describe the next unused descriptor as `addr`/`len` and publish it on
    /// the used ring. Master init only.
    pub fn fill_used_buffers(&self, addr: u64, len: u32) -> Result<u16, VringError> {
        let mut local = self.local.lock();
        let head = local.desc_head_idx;
        self.check_idx(head).map_err(|_| VringError::DescriptorsExhausted)?;

        self.write_desc(head, addr, len, 0, head.wrapping_add(1));
        local.desc_head_idx += 1;
        self.update_used(&mut local, head, len);
        Ok(head)
    }

    /// Publish descriptor `head_idx` on the avail ring.
    pub fn add_buffer(&self, head_idx: u16) -> Result<(), VringError> {
        self.check_idx(head_idx)?;
        let mut local = self.local.lock();
        self.update_avail(&mut local, head_idx);
        Ok(())
    }

    /// Publish descriptor `head_idx` on the used ring with `len` bytes.
    pub fn add_consumed_buffer(&self, head_idx: u16, len: u32) -> Result<(), VringError> {
        self.check_idx(head_idx)?;
        let mut local = self.local.lock();
        self.update_used(&mut local, head_idx, len);
        Ok(())
    }

    /// Point descriptor `idx` back at `addr`, keeping its length and flags.
    pub fn set_desc_addr(&self, idx: u16, addr: u64) -> Result<(), VringError> {
        self.check_idx(idx)?;
        let at = self.ring.desc(idx);
        self.shm.store_u32(at, addr as u32);
        self.shm.store_u32(at + 4, (addr >> 32) as u32);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Consumer side
    // -------------------------------------------------------------------------

    /// Take the next entry off the used ring.
    ///
    /// An entry naming a descriptor outside the table is skipped and reported;
    /// the next call moves on to the entry after it.
    pub fn get_buffer(&self) -> Result<Option<RingBuffer>, VringError> {
        let mut local = self.local.lock();
        if local.used_cons_idx == self.shm.load_u16(self.ring.used_idx()) {
            return Ok(None);
        }
        self.platform.barrier();

        let elem = self.ring.used_elem(local.used_cons_idx & self.mask());
        let id = self.shm.load_u32(elem);
        let len = self.shm.load_u32(elem + 4);
        // The slot is consumed even when its entry is garbage.
        local.used_cons_idx = local.used_cons_idx.wrapping_add(1);
        let idx = u16::try_from(id)
            .ok()
            .filter(|idx| *idx < self.ring.num)
            .ok_or(VringError::IndexOutOfRange {
                idx: id.min(u16::MAX as u32) as u16,
                num: self.ring.num,
            })?;

        let (addr, _) = self.read_desc(idx);
        Ok(Some(RingBuffer { idx, addr, len }))
    }

    /// Take the next entry off the avail ring.
    pub fn get_available_buffer(&self) -> Result<Option<RingBuffer>, VringError> {
        let mut local = self.local.lock();
        if local.available_idx == self.shm.load_u16(self.ring.avail_idx()) {
            return Ok(None);
        }

        let slot = local.available_idx & self.mask();
        let idx = self.shm.load_u16(self.ring.avail_ring(slot));
        self.platform.barrier();
        local.available_idx = local.available_idx.wrapping_add(1);
        self.check_idx(idx)?;

        let (addr, len) = self.read_desc(idx);
        Ok(Some(RingBuffer { idx, addr, len }))
    }

    /// Entries on the used ring not yet taken.
    pub fn used_pending(&self) -> u16 {
        let local = self.local.lock();
        self.shm
            .load_u16(self.ring.used_idx())
            .wrapping_sub(local.used_cons_idx)
    }

    /// Entries on the avail ring not yet taken.
    pub fn avail_pending(&self) -> u16 {
        let local = self.local.lock();
        self.shm
            .load_u16(self.ring.avail_idx())
            .wrapping_sub(local.available_idx)
    }

    /// Notify the peer that this vring changed.
    pub fn kick(&self) {
        let queued = std::mem::take(&mut self.local.lock().queued);
        tracing::trace!(vq = self.name, vq_id = self.id, queued, "kick");
        self.platform.notify(self.id);
    }
}

impl std::fmt::Debug for Virtqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Virtqueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ring", &self.ring)
            .finish()
    }
}

/// Errors from vring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VringError {
    /// Every descriptor has already been filled.
    DescriptorsExhausted,
    /// The ring named a descriptor that does not exist.
    IndexOutOfRange { idx: u16, num: u16 },
}

impl std::fmt::Display for VringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DescriptorsExhausted => write!(f, "all descriptors already filled"),
            Self::IndexOutOfRange { idx, num } => {
                write!(f, "descriptor index {} out of range (num {})", idx, num)
            }
        }
    }
}

impl std::error::Error for VringError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    use rpmsg_core::{Isr, RpmsgError};

    use crate::config::ShmConfig;
    use crate::layout::RegionLayout;

    /// Counts notifies, routes nothing.
    #[derive(Default)]
    struct NullPlatform {
        notified: Mutex<Vec<u32>>,
    }

    impl Platform for NullPlatform {
        fn init_interrupt(&self, _vq_id: u32, _isr: Weak<dyn Isr>) -> Result<(), RpmsgError> {
            Ok(())
        }

        fn deinit_interrupt(&self, _vq_id: u32) -> Result<(), RpmsgError> {
            Ok(())
        }

        fn notify(&self, vq_id: u32) {
            self.notified.lock().push(vq_id);
        }
    }

    fn setup(num: u16) -> (Arc<NullPlatform>, Virtqueue, Virtqueue) {
        let config = ShmConfig::default()
            .with_buffer_count(num)
            .with_vring_align(16);
        let layout = RegionLayout::calculate(&config).unwrap();
        let shm = SharedMemory::new(layout.total_size).unwrap();
        let platform = Arc::new(NullPlatform::default());
        let producer = Virtqueue::new(0, "tx", shm.clone(), layout.vrings[0], platform.clone());
        let consumer = Virtqueue::new(0, "rx", shm, layout.vrings[0], platform.clone());
        (platform, producer, consumer)
    }

    #[test]
    fn test_fill_avail_then_take() {
        let (_platform, master, remote) = setup(4);
        for i in 0..4u16 {
            assert_eq!(master.fill_avail_buffers(0x1000 + i as u64 * 64, 64), Ok(i));
        }
        assert_eq!(
            master.fill_avail_buffers(0, 64),
            Err(VringError::DescriptorsExhausted)
        );

        assert_eq!(remote.avail_pending(), 4);
        for i in 0..4u16 {
            let buf = remote.get_available_buffer().unwrap().unwrap();
            assert_eq!(buf.idx, i);
            assert_eq!(buf.addr, 0x1000 + i as u64 * 64);
            assert_eq!(buf.len, 64);
        }
        assert_eq!(remote.get_available_buffer(), Ok(None));
    }

    #[test]
    fn test_used_ring_fifo_across_wrap() {
        let (_platform, master, remote) = setup(4);
        for i in 0..4u16 {
            master.fill_avail_buffers(i as u64 * 64, 64).unwrap();
        }

        // Cycle the four buffers far past the 16-bit index wrap.
        for round in 0..70_000u32 {
            let buf = remote.get_available_buffer().unwrap().unwrap();
            remote.add_consumed_buffer(buf.idx, round).unwrap();
            let used = master.get_buffer().unwrap().unwrap();
            assert_eq!(used.idx, buf.idx);
            assert_eq!(used.len, round);
            master.add_buffer(used.idx).unwrap();
        }
        assert_eq!(master.used_pending(), 0);
        assert_eq!(remote.avail_pending(), 4);
    }

    #[test]
    fn test_fill_used_is_visible_to_get_buffer() {
        let (_platform, master, _remote) = setup(2);
        master.fill_used_buffers(0x4000, 512).unwrap();
        master.fill_used_buffers(0x4200, 512).unwrap();

        let first = master.get_buffer().unwrap().unwrap();
        assert_eq!((first.idx, first.addr, first.len), (0, 0x4000, 512));
        let second = master.get_buffer().unwrap().unwrap();
        assert_eq!((second.idx, second.addr), (1, 0x4200));
        assert_eq!(master.get_buffer(), Ok(None));
    }

    #[test]
    fn test_rejects_out_of_range_index() {
        let (_platform, vq, _) = setup(2);
        assert_eq!(
            vq.add_buffer(2),
            Err(VringError::IndexOutOfRange { idx: 2, num: 2 })
        );
        assert!(vq.add_consumed_buffer(7, 0).is_err());
    }

    #[test]
    fn test_bad_avail_entry_is_skipped() {
        let (_platform, master, remote) = setup(4);
        master.fill_avail_buffers(0x1000, 64).unwrap();
        master.fill_avail_buffers(0x1040, 64).unwrap();

        // Corrupt the first published entry.
        master.shm.store_u16(master.ring.avail_ring(0), 99);

        assert_eq!(
            remote.get_available_buffer(),
            Err(VringError::IndexOutOfRange { idx: 99, num: 4 })
        );
        assert_eq!(remote.avail_pending(), 1);
        let next = remote.get_available_buffer().unwrap().unwrap();
        assert_eq!((next.idx, next.addr), (1, 0x1040));
        assert_eq!(remote.get_available_buffer(), Ok(None));
    }

    #[test]
    fn test_bad_used_entry_is_skipped() {
        let (_platform, master, _remote) = setup(2);
        master.fill_used_buffers(0x4000, 512).unwrap();
        master.fill_used_buffers(0x4200, 512).unwrap();
        master.shm.store_u32(master.ring.used_elem(0), 0x1_0000);

        assert!(matches!(
            master.get_buffer(),
            Err(VringError::IndexOutOfRange { num: 2, .. })
        ));
        let next = master.get_buffer().unwrap().unwrap();
        assert_eq!((next.idx, next.addr), (1, 0x4200));
        assert_eq!(master.used_pending(), 0);
    }

    #[test]
    fn test_set_desc_addr_keeps_length() {
        let (_platform, master, remote) = setup(2);
        master.fill_avail_buffers(0x1000, 64).unwrap();
        master.set_desc_addr(0, 0x9000).unwrap();
        assert!(master.set_desc_addr(2, 0).is_err());

        let buf = remote.get_available_buffer().unwrap().unwrap();
        assert_eq!((buf.addr, buf.len), (0x9000, 64));
    }

    #[test]
    fn test_kick_notifies_own_id() {
        let (platform, vq, _) = setup(2);
        vq.fill_avail_buffers(0, 16).unwrap();
        vq.kick();
        assert_eq!(*platform.notified.lock(), vec![0]);
    }
}
