//! The virtqueue pair of one link and ownership of the buffers behind it.
//!
//! Which vring operation moves a buffer depends on the role:
//!
//! ```text
//!                 master                      remote
//! alloc tx        tvq.get_buffer              tvq.get_available_buffer
//! send            tvq.add_buffer              tvq.add_consumed_buffer
//! receive         rvq.get_buffer              rvq.get_available_buffer
//! release rx      rvq.add_buffer              rvq.add_consumed_buffer
//! ```
//!
//! On top of the vrings every descriptor carries a local state and a
//! generation, so a buffer can only be sent or released by whoever took it
//! off the ring, and only once.

use std::sync::Arc;

use parking_lot::Mutex;
use rpmsg_core::{vq_id, Platform, HEADER_SIZE};

use crate::config::ShmConfig;
use crate::layout::{RegionLayout, SharedMemory};
use crate::virtqueue::{RingBuffer, Virtqueue, VringError};

/// Which side of the link this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initializes the region and carves the buffers.
    Master,
    /// Attaches to a region the master initialized.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Rx,
    Tx,
}

/// Local state of one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescState {
    /// On a vring: in flight to the peer, or waiting there for us.
    OnRing,
    /// Taken off the ring and handed to a caller.
    Held,
    /// Allocated for transmit, then dropped unsent.
    Stashed,
}

/// A descriptor a caller holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferClaim {
    pub idx: u16,
    pub generation: u32,
    /// Offset of the buffer in the region.
    pub offset: usize,
    /// Bytes the ring reported with the buffer.
    pub ring_len: u32,
}

/// State and generation of every descriptor of one vring.
#[derive(Debug)]
struct Ownership {
    state: Vec<DescState>,
    generation: Vec<u32>,
    stash: Vec<BufferClaim>,
}

impl Ownership {
    fn new(num: u16) -> Self {
        Self {
            state: vec![DescState::OnRing; num as usize],
            generation: vec![0; num as usize],
            stash: Vec::new(),
        }
    }

    /// OnRing -> Held.
    fn take(&mut self, buf: RingBuffer, offset: usize) -> Result<BufferClaim, PoolError> {
        let i = buf.idx as usize;
        match self.state.get(i) {
            Some(DescState::OnRing) => {}
            Some(state) => {
                return Err(PoolError::NotOnRing {
                    idx: buf.idx,
                    state: *state,
                })
            }
            None => return Err(PoolError::Vring(VringError::IndexOutOfRange {
                idx: buf.idx,
                num: self.state.len() as u16,
            })),
        }
        self.state[i] = DescState::Held;
        self.generation[i] = self.generation[i].wrapping_add(1);
        Ok(BufferClaim {
            idx: buf.idx,
            generation: self.generation[i],
            offset,
            ring_len: buf.len,
        })
    }

    fn check_held(&self, claim: &BufferClaim) -> Result<(), PoolError> {
        let i = claim.idx as usize;
        if self.state.get(i) != Some(&DescState::Held) || self.generation[i] != claim.generation {
            return Err(PoolError::Stale { idx: claim.idx });
        }
        Ok(())
    }

    /// Held -> OnRing.
    fn put_back(&mut self, claim: &BufferClaim) -> Result<(), PoolError> {
        self.check_held(claim)?;
        self.state[claim.idx as usize] = DescState::OnRing;
        Ok(())
    }

    /// Held -> Stashed.
    fn stash(&mut self, claim: BufferClaim) -> Result<(), PoolError> {
        self.check_held(&claim)?;
        self.state[claim.idx as usize] = DescState::Stashed;
        self.stash.push(claim);
        Ok(())
    }

    /// Stashed -> Held.
    fn unstash(&mut self) -> Option<BufferClaim> {
        let mut claim = self.stash.pop()?;
        let i = claim.idx as usize;
        self.state[i] = DescState::Held;
        self.generation[i] = self.generation[i].wrapping_add(1);
        claim.generation = self.generation[i];
        Some(claim)
    }

    fn is_on_ring(&self, idx: u16) -> bool {
        self.state.get(idx as usize) == Some(&DescState::OnRing)
    }

    fn count(&self, wanted: DescState) -> usize {
        self.state.iter().filter(|s| **s == wanted).count()
    }
}

/// Bookkeeping of the master's buffer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaInfo {
    /// Offset of the arena in the region.
    pub base: usize,
    /// Bytes of the arena.
    pub total: usize,
    /// Bytes not carved into buffers.
    pub remaining: usize,
}

/// Receive and transmit virtqueue of one side of a link.
pub struct VirtqueuePair {
    role: Role,
    rvq: Virtqueue,
    tvq: Virtqueue,
    shm: Arc<SharedMemory>,
    layout: RegionLayout,
    pa_base: u64,
    clear_used_buffers: bool,
    tx: Mutex<Ownership>,
    rx: Mutex<Ownership>,
    arena: ArenaInfo,
}

/// Build both virtqueues of `link_id` over `shm`.
///
/// The master zeroes the vrings, then carves `buffer_count` receive buffers
/// onto vring 0's avail ring and `buffer_count` transmit buffers onto vring
/// 1's used ring. The remote only attaches.
pub fn create_virtqueue_pair(
    shm: Arc<SharedMemory>,
    config: &ShmConfig,
    role: Role,
    link_id: u32,
    platform: Arc<dyn Platform>,
) -> Result<VirtqueuePair, PoolError> {
    let layout = RegionLayout::calculate(config).map_err(|_| PoolError::LayoutOverflow)?;
    config
        .pa_base
        .checked_add(layout.total_size as u64)
        .ok_or(PoolError::LayoutOverflow)?;
    if shm.len() < layout.total_size {
        return Err(PoolError::RegionTooSmall {
            required: layout.total_size,
            available: shm.len(),
        });
    }

    let vring0 = Virtqueue::new(
        vq_id(link_id, 0),
        if role == Role::Master { "rx_vq" } else { "tx_vq" },
        shm.clone(),
        layout.vrings[0],
        platform.clone(),
    );
    let vring1 = Virtqueue::new(
        vq_id(link_id, 1),
        if role == Role::Master { "tx_vq" } else { "rx_vq" },
        shm.clone(),
        layout.vrings[1],
        platform,
    );
    let (rvq, tvq) = match role {
        Role::Master => (vring0, vring1),
        Role::Remote => (vring1, vring0),
    };

    let num = layout.buffer_count;
    let mut arena = ArenaInfo::default();

    if role == Role::Master {
        // SAFETY: the remote must not touch the region before the master
        // finished init; that is the attach contract.
        unsafe {
            rvq.reset();
            tvq.reset();
        }

        arena.base = layout.arena;
        arena.total = shm.len() - layout.arena;
        arena.remaining = arena.total;

        let buffer_len = layout.buffer_size as u32;
        for i in 0..num as usize {
            rvq.fill_avail_buffers(config.pa_base + layout.buffer(i) as u64, buffer_len)?;
            arena.remaining -= layout.buffer_size;
        }
        for i in 0..num as usize {
            tvq.fill_used_buffers(
                config.pa_base + layout.buffer(num as usize + i) as u64,
                buffer_len,
            )?;
            arena.remaining -= layout.buffer_size;
        }
    }

    Ok(VirtqueuePair {
        role,
        rvq,
        tvq,
        shm,
        layout,
        pa_base: config.pa_base,
        clear_used_buffers: config.clear_used_buffers,
        tx: Mutex::new(Ownership::new(num)),
        rx: Mutex::new(Ownership::new(num)),
        arena,
    })
}

impl VirtqueuePair {
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn rvq(&self) -> &Virtqueue {
        &self.rvq
    }

    #[inline]
    pub fn tvq(&self) -> &Virtqueue {
        &self.tvq
    }

    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    #[inline]
    pub fn arena(&self) -> ArenaInfo {
        self.arena
    }

    #[inline]
    pub(crate) fn shm(&self) -> &SharedMemory {
        &self.shm
    }

    /// Region offset of the buffer behind `addr`.
    fn translate(&self, addr: u64) -> Result<usize, PoolError> {
        let offset = addr
            .checked_sub(self.pa_base)
            .and_then(|o| usize::try_from(o).ok())
            .ok_or(PoolError::BadAddress { addr })?;
        let in_arena = offset >= self.layout.arena
            && (offset - self.layout.arena) % self.layout.buffer_size == 0
            && self.shm.contains(offset, self.layout.buffer_size);
        if !in_arena {
            return Err(PoolError::BadAddress { addr });
        }
        Ok(offset)
    }

    /// Take a free transmit buffer, if any.
    ///
    /// An error means one bad ring entry was consumed; the next call moves
    /// on to the entry after it.
    pub(crate) fn try_alloc_tx(&self) -> Result<Option<BufferClaim>, PoolError> {
        if let Some(claim) = self.tx.lock().unstash() {
            return Ok(Some(claim));
        }
        self.take_next(Direction::Tx)
    }

    /// Publish a filled transmit buffer holding `frame_len` bytes and kick
    /// the peer.
    pub(crate) fn enqueue(&self, claim: BufferClaim, frame_len: usize) -> Result<(), PoolError> {
        {
            let mut tx = self.tx.lock();
            tx.check_held(&claim)?;
            match self.role {
                Role::Master => self.tvq.add_buffer(claim.idx)?,
                Role::Remote => self.tvq.add_consumed_buffer(claim.idx, frame_len as u32)?,
            }
            tx.put_back(&claim)?;
        }
        self.tvq.kick();
        Ok(())
    }

    /// Keep an unsent transmit buffer for the next allocation.
    pub(crate) fn unalloc_tx(&self, claim: BufferClaim) -> Result<(), PoolError> {
        self.tx.lock().stash(claim)
    }

    /// Take the next received buffer, if any.
    ///
    /// Errors as [`try_alloc_tx`](Self::try_alloc_tx).
    pub(crate) fn dequeue(&self) -> Result<Option<BufferClaim>, PoolError> {
        self.take_next(Direction::Rx)
    }

    fn take_next(&self, dir: Direction) -> Result<Option<BufferClaim>, PoolError> {
        let (vq, own) = match dir {
            Direction::Rx => (&self.rvq, &self.rx),
            Direction::Tx => (&self.tvq, &self.tx),
        };
        let handed_back = {
            let mut own = own.lock();
            let buf = match self.role {
                Role::Master => vq.get_buffer()?,
                Role::Remote => vq.get_available_buffer()?,
            };
            let Some(buf) = buf else {
                return Ok(None);
            };
            match self.translate(buf.addr) {
                Ok(offset) => return own.take(buf, offset).map(Some),
                Err(e) => match self.role {
                    // The master wrote every descriptor; put the address back.
                    Role::Master => {
                        let offset = self.home_offset(dir, buf.idx);
                        vq.set_desc_addr(buf.idx, self.pa_base + offset as u64)?;
                        return own.take(buf, offset).map(Some);
                    }
                    // Ours only if we never took it; then it goes straight back.
                    Role::Remote if own.is_on_ring(buf.idx) => {
                        vq.add_consumed_buffer(buf.idx, 0)?;
                        e
                    }
                    Role::Remote => return Err(e),
                },
            }
        };
        vq.kick();
        Err(handed_back)
    }

    /// Offset of the buffer the master carved for descriptor `idx`.
    fn home_offset(&self, dir: Direction, idx: u16) -> usize {
        let on_vring0 = matches!(
            (self.role, dir),
            (Role::Master, Direction::Rx) | (Role::Remote, Direction::Tx)
        );
        let n = idx as usize;
        if on_vring0 {
            self.layout.buffer(n)
        } else {
            self.layout.buffer(self.layout.buffer_count as usize + n)
        }
    }

    /// Return a received buffer to the peer, kicking it when `notify`.
    pub(crate) fn release_rx(&self, claim: BufferClaim, notify: bool) -> Result<(), PoolError> {
        {
            let mut rx = self.rx.lock();
            rx.check_held(&claim)?;
            if self.clear_used_buffers {
                // SAFETY: we hold the descriptor, the peer does not touch it.
                unsafe { self.shm.zero(claim.offset, self.layout.buffer_size) };
            }
            match self.role {
                Role::Master => self.rvq.add_buffer(claim.idx)?,
                Role::Remote => self
                    .rvq
                    .add_consumed_buffer(claim.idx, self.layout.buffer_size as u32)?,
            }
            rx.put_back(&claim)?;
        }
        if notify {
            self.rvq.kick();
        }
        Ok(())
    }

    /// Bytes of a buffer a frame may occupy: what the ring reported, capped
    /// at the buffer size.
    pub(crate) fn frame_window(&self, claim: &BufferClaim) -> usize {
        (claim.ring_len as usize).min(self.layout.buffer_size)
    }

    /// Transmit buffers currently held by callers or stashed.
    pub fn tx_outstanding(&self) -> usize {
        let tx = self.tx.lock();
        tx.count(DescState::Held) + tx.count(DescState::Stashed)
    }

    /// Receive buffers currently held by callers.
    pub fn rx_outstanding(&self) -> usize {
        self.rx.lock().count(DescState::Held)
    }

    /// Usable payload bytes of every buffer.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.layout.buffer_size - HEADER_SIZE
    }
}

impl std::fmt::Debug for VirtqueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtqueuePair")
            .field("role", &self.role)
            .field("rvq", &self.rvq)
            .field("tvq", &self.tvq)
            .field("arena", &self.arena)
            .finish()
    }
}

/// Errors from buffer ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    Vring(VringError),
    /// A descriptor pointed outside the buffer arena.
    BadAddress { addr: u64 },
    /// The peer handed back a descriptor we never gave it.
    NotOnRing { idx: u16, state: DescState },
    /// The claim no longer matches the descriptor.
    Stale { idx: u16 },
    /// Region smaller than the layout.
    RegionTooSmall { required: usize, available: usize },
    LayoutOverflow,
}

impl From<VringError> for PoolError {
    fn from(e: VringError) -> Self {
        Self::Vring(e)
    }
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vring(e) => write!(f, "{}", e),
            Self::BadAddress { addr } => {
                write!(f, "descriptor address {:#x} is not a buffer", addr)
            }
            Self::NotOnRing { idx, state } => {
                write!(f, "descriptor {} came off the ring while {:?}", idx, state)
            }
            Self::Stale { idx } => write!(f, "stale claim on descriptor {}", idx),
            Self::RegionTooSmall {
                required,
                available,
            } => write!(
                f,
                "region too small: need {} bytes, got {}",
                required, available
            ),
            Self::LayoutOverflow => write!(f, "layout size overflow"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    use rpmsg_core::{Isr, RpmsgError};

    struct QuietPlatform;

    impl Platform for QuietPlatform {
        fn init_interrupt(&self, _vq_id: u32, _isr: Weak<dyn Isr>) -> Result<(), RpmsgError> {
            Ok(())
        }

        fn deinit_interrupt(&self, _vq_id: u32) -> Result<(), RpmsgError> {
            Ok(())
        }

        fn notify(&self, _vq_id: u32) {}
    }

    fn config() -> ShmConfig {
        ShmConfig::default()
            .with_buffer_count(4)
            .with_vring_align(16)
            .with_pa_base(0x2000_0000)
    }

    fn pair() -> (VirtqueuePair, VirtqueuePair) {
        let config = config();
        let shm = SharedMemory::new(config.region_size().unwrap()).unwrap();
        let master =
            create_virtqueue_pair(shm.clone(), &config, Role::Master, 0, Arc::new(QuietPlatform))
                .unwrap();
        let remote =
            create_virtqueue_pair(shm, &config, Role::Remote, 0, Arc::new(QuietPlatform)).unwrap();
        (master, remote)
    }

    #[test]
    fn test_master_carves_whole_arena() {
        let (master, remote) = pair();
        let arena = master.arena();
        assert_eq!(arena.total, 4096);
        assert_eq!(arena.remaining, 0);
        assert_eq!(remote.arena(), ArenaInfo::default());
        assert_eq!(master.rvq().id(), 0);
        assert_eq!(master.tvq().id(), 1);
        assert_eq!(remote.rvq().id(), 1);
        assert_eq!(remote.tvq().id(), 0);
    }

    #[test]
    fn test_remote_to_master_roundtrip() {
        let (master, remote) = pair();

        let claim = remote.try_alloc_tx().unwrap().unwrap();
        assert_eq!(remote.tx_outstanding(), 1);
        remote.enqueue(claim, HEADER_SIZE + 5).unwrap();
        assert_eq!(remote.tx_outstanding(), 0);

        let got = master.dequeue().unwrap().unwrap();
        assert_eq!(got.offset, claim.offset);
        assert_eq!(got.ring_len as usize, HEADER_SIZE + 5);
        master.release_rx(got, true).unwrap();
        assert_eq!(master.rx_outstanding(), 0);
    }

    #[test]
    fn test_master_tx_exhaustion_and_recovery() {
        let (master, remote) = pair();

        let mut sent = Vec::new();
        for _ in 0..4 {
            let claim = master.try_alloc_tx().unwrap().unwrap();
            master.enqueue(claim, HEADER_SIZE).unwrap();
            sent.push(claim.offset);
        }
        assert_eq!(master.try_alloc_tx(), Ok(None));

        let got = remote.dequeue().unwrap().unwrap();
        assert_eq!(got.offset, sent[0]);
        remote.release_rx(got, false).unwrap();

        let again = master.try_alloc_tx().unwrap().unwrap();
        assert_eq!(again.offset, sent[0]);
    }

    #[test]
    fn test_no_double_allocation() {
        let (master, _remote) = pair();
        let mut offsets = Vec::new();
        while let Some(claim) = master.try_alloc_tx().unwrap() {
            assert!(!offsets.contains(&claim.offset));
            offsets.push(claim.offset);
        }
        assert_eq!(offsets.len(), 4);
    }

    #[test]
    fn test_stash_reuses_unsent_buffer() {
        let (master, _remote) = pair();
        let claim = master.try_alloc_tx().unwrap().unwrap();
        master.unalloc_tx(claim).unwrap();
        assert_eq!(master.tx_outstanding(), 1);

        let again = master.try_alloc_tx().unwrap().unwrap();
        assert_eq!(again.idx, claim.idx);
        assert_ne!(again.generation, claim.generation);

        // The old claim is dead.
        assert_eq!(
            master.enqueue(claim, HEADER_SIZE),
            Err(PoolError::Stale { idx: claim.idx })
        );
        master.enqueue(again, HEADER_SIZE).unwrap();
    }

    #[test]
    fn test_double_release_is_stale() {
        let (master, remote) = pair();
        let claim = remote.try_alloc_tx().unwrap().unwrap();
        remote.enqueue(claim, HEADER_SIZE).unwrap();

        let got = master.dequeue().unwrap().unwrap();
        master.release_rx(got, false).unwrap();
        assert_eq!(
            master.release_rx(got, false),
            Err(PoolError::Stale { idx: got.idx })
        );
    }

    #[test]
    fn test_clear_used_buffers_zeroes_on_release() {
        let config = config().with_clear_used_buffers(true);
        let shm = SharedMemory::new(config.region_size().unwrap()).unwrap();
        let master =
            create_virtqueue_pair(shm.clone(), &config, Role::Master, 0, Arc::new(QuietPlatform))
                .unwrap();
        let remote =
            create_virtqueue_pair(shm.clone(), &config, Role::Remote, 0, Arc::new(QuietPlatform))
                .unwrap();

        let claim = remote.try_alloc_tx().unwrap().unwrap();
        // SAFETY: we hold the descriptor.
        unsafe { shm.slice_mut(claim.offset, 4) }.copy_from_slice(b"junk");
        remote.enqueue(claim, 4).unwrap();

        let got = master.dequeue().unwrap().unwrap();
        master.release_rx(got, false).unwrap();
        // SAFETY: single-threaded test, nobody holds the buffer.
        assert_eq!(unsafe { shm.slice(got.offset, 4) }, &[0, 0, 0, 0]);
    }

    #[test]
    fn test_master_rewrites_bad_descriptor_address() {
        let (master, _remote) = pair();
        let layout = *master.layout();
        master.shm().store_u32(layout.vrings[1].desc(0), 0x10);

        let claim = master.try_alloc_tx().unwrap().unwrap();
        assert_eq!(claim.idx, 0);
        assert_eq!(claim.offset, layout.buffer(4));
        assert_eq!(
            master.shm().load_u32(layout.vrings[1].desc(0)) as u64,
            0x2000_0000 + layout.buffer(4) as u64
        );
    }

    #[test]
    fn test_remote_hands_back_bad_descriptor() {
        let (master, remote) = pair();
        let layout = *master.layout();
        master.shm().store_u32(layout.vrings[0].desc(0), 0x10);

        assert_eq!(
            remote.try_alloc_tx(),
            Err(PoolError::BadAddress { addr: 0x10 })
        );
        assert_eq!(remote.tx_outstanding(), 0);
        let next = remote.try_alloc_tx().unwrap().unwrap();
        assert_eq!(next.idx, 1);

        // The master gets the descriptor back empty and repairs it.
        let back = master.dequeue().unwrap().unwrap();
        assert_eq!((back.idx, back.ring_len), (0, 0));
        assert_eq!(back.offset, layout.buffer(0));
        master.release_rx(back, false).unwrap();
        assert_eq!(master.rx_outstanding(), 0);
    }

    #[test]
    fn test_pa_base_overflow_refused() {
        let config = config().with_pa_base(u64::MAX - 8);
        let shm = SharedMemory::new(config.clone().with_pa_base(0).region_size().unwrap()).unwrap();
        let err = create_virtqueue_pair(shm, &config, Role::Master, 0, Arc::new(QuietPlatform))
            .unwrap_err();
        assert_eq!(err, PoolError::LayoutOverflow);
    }

    #[test]
    fn test_region_too_small() {
        let config = config();
        let shm = SharedMemory::new(config.region_size().unwrap() - 1).unwrap();
        let err = create_virtqueue_pair(shm, &config, Role::Master, 0, Arc::new(QuietPlatform))
            .unwrap_err();
        assert!(matches!(err, PoolError::RegionTooSmall { .. }));
    }
}
