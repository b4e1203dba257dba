//! The link controller: one side of one shared-memory link.
//!
//! ```text
//!   DOWN ──(policy)──▶ UP ──signal_link_down──▶ DOWN
//!     │                 │
//!     └──── deinit ─────┴──▶ DESTROYED
//! ```
//!
//! Receive runs from the platform's notification context or from
//! [`RpmsgLite::poll`]; send and allocation run on the caller's thread.
//! Kicks to the peer are always raised with no lock held, so a platform that
//! delivers synchronously may re-enter the instance.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use rpmsg_core::{vq_id, Isr, MsgHeader, Platform, RpmsgError, Timeout, HEADER_SIZE};

use crate::buffer::{RxBuffer, TxBuffer};
use crate::config::{LinkPolicy, ShmConfig};
use crate::endpoint::{Endpoint, EndpointRegistry, MessageHandler};
use crate::layout::SharedMemory;
use crate::pool::{create_virtqueue_pair, ArenaInfo, BufferClaim, PoolError, Role, VirtqueuePair};
use crate::virtqueue::VringError;

// ============================================================================
// Link state
// ============================================================================

/// Phase of the link as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    Down = 0,
    Up = 1,
    Destroyed = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Down,
            1 => Self::Up,
            _ => Self::Destroyed,
        }
    }
}

/// Snapshot of an instance's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStats {
    /// Messages handed to the peer.
    pub tx_messages: u64,
    /// Messages delivered to a local endpoint.
    pub rx_messages: u64,
    /// Messages dropped for lack of an endpoint at their destination.
    pub unreachable: u64,
    /// Messages dropped because their header or descriptor was bad.
    pub corrupt: u64,
    /// Notifications on the transmit vring, i.e. the peer returned buffers.
    pub tx_buffers_freed_notifications: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tx_messages: AtomicU64,
    rx_messages: AtomicU64,
    unreachable: AtomicU64,
    corrupt: AtomicU64,
    tx_buffers_freed_notifications: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkStats {
        LinkStats {
            tx_messages: self.tx_messages.load(Ordering::Relaxed),
            rx_messages: self.rx_messages.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
            tx_buffers_freed_notifications: self
                .tx_buffers_freed_notifications
                .load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Core
// ============================================================================

/// State shared by an [`RpmsgLite`] and the buffers and ISRs it hands out.
pub(crate) struct Core {
    me: Weak<Core>,
    role: Role,
    link_id: u32,
    config: ShmConfig,
    queues: VirtqueuePair,
    registry: EndpointRegistry,
    platform: Arc<dyn Platform>,
    state: AtomicU8,
    counters: Counters,
    /// Set while a thread drains the receive vring.
    rx_busy: AtomicBool,
    /// A notification arrived that the draining thread has not seen yet.
    rx_pending: AtomicBool,
}

impl Core {
    #[inline]
    fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn is_destroyed(&self) -> bool {
        self.state() == LinkState::Destroyed
    }

    fn ensure_alive(&self) -> Result<(), RpmsgError> {
        if self.is_destroyed() {
            return Err(RpmsgError::Destroyed);
        }
        Ok(())
    }

    fn ensure_up(&self) -> Result<(), RpmsgError> {
        match self.state() {
            LinkState::Up => Ok(()),
            LinkState::Down => Err(RpmsgError::NotReady),
            LinkState::Destroyed => Err(RpmsgError::Destroyed),
        }
    }

    /// Move `from` -> `to`; false if the state was something else.
    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!(link_id = self.link_id, role = ?self.role, ?from, ?to, "link state");
        }
        moved
    }

    /// Usable payload bytes of a buffer.
    #[inline]
    pub(crate) fn max_payload(&self) -> usize {
        self.config.buffer_payload_size
    }

    #[inline]
    pub(crate) fn shm(&self) -> &SharedMemory {
        self.queues.shm()
    }

    /// Stash a transmit buffer that was dropped unsent.
    pub(crate) fn unalloc_tx(&self, claim: BufferClaim) {
        if self.is_destroyed() {
            return;
        }
        if let Err(e) = self.queues.unalloc_tx(claim) {
            tracing::warn!(link_id = self.link_id, idx = claim.idx, error = %e, "dropped stale tx buffer");
        }
    }

    /// Give a received buffer back to the peer.
    pub(crate) fn release_rx_claim(&self, claim: BufferClaim) -> Result<(), RpmsgError> {
        if self.is_destroyed() {
            return Ok(());
        }
        self.queues
            .release_rx(claim, self.config.notify_consumed_buffers)
            .map_err(|e| pool_error(e, self.queues.rvq().id()))
    }

    /// The peer moved buffers on our transmit vring.
    fn on_tx_notify(&self) {
        Counters::bump(&self.counters.tx_buffers_freed_notifications);
        match (self.role, self.config.link_policy) {
            (Role::Remote, LinkPolicy::MasterKick) => {
                self.transition(LinkState::Down, LinkState::Up);
            }
            (Role::Remote, LinkPolicy::Handshake) => {
                if self.transition(LinkState::Down, LinkState::Up) {
                    self.queues.rvq().kick();
                }
            }
            (Role::Master, LinkPolicy::Handshake) => {
                self.transition(LinkState::Down, LinkState::Up);
            }
            _ => {}
        }
    }

    /// Drain the receive vring unless another thread already is.
    ///
    /// A thread that finds the drain busy leaves a pending mark; the drainer
    /// checks it before giving up the drain, so no notification is lost.
    fn drain_rx(&self) -> usize {
        let Some(this) = self.me.upgrade() else {
            return 0;
        };

        self.rx_pending.store(true, Ordering::Release);
        let mut taken = 0;
        loop {
            if self.rx_busy.swap(true, Ordering::AcqRel) {
                return taken;
            }
            while self.rx_pending.swap(false, Ordering::AcqRel) {
                taken += self.drain_once(&this);
            }
            self.rx_busy.store(false, Ordering::Release);
            if !self.rx_pending.load(Ordering::Acquire) {
                return taken;
            }
        }
    }

    fn drain_once(&self, this: &Arc<Core>) -> usize {
        let mut taken = 0;
        while !self.is_destroyed() {
            let claim = match self.queues.dequeue() {
                Ok(Some(claim)) => claim,
                Ok(None) => break,
                Err(e) => {
                    Counters::bump(&self.counters.corrupt);
                    tracing::warn!(link_id = self.link_id, error = %e, "skipped bad descriptor on rx vring");
                    continue;
                }
            };
            taken += 1;
            self.deliver(this, claim);
        }
        taken
    }

    fn deliver(&self, this: &Arc<Core>, claim: BufferClaim) {
        let window = self.queues.frame_window(&claim);
        // SAFETY: we hold the descriptor; the peer is done writing it.
        let frame = unsafe { self.shm().slice(claim.offset, window) };
        let mut header = match MsgHeader::decode(frame) {
            Ok(header) => header,
            Err(e) => {
                Counters::bump(&self.counters.corrupt);
                tracing::warn!(link_id = self.link_id, idx = claim.idx, error = %e, "dropping corrupt message");
                if let Err(e) = self.release_rx_claim(claim) {
                    tracing::warn!(link_id = self.link_id, error = %e, "failed to release corrupt buffer");
                }
                return;
            }
        };

        // Record the descriptor in the header the way a held buffer expects.
        header.reserved.idx = claim.idx;
        // SAFETY: as above; the idx field sits at bytes 10..12 of the header.
        unsafe { self.shm().slice_mut(claim.offset + 10, 2) }
            .copy_from_slice(&claim.idx.to_le_bytes());

        tracing::trace!(
            link_id = self.link_id,
            src = header.src,
            dst = header.dst,
            len = header.len,
            "rx"
        );
        let msg = RxBuffer::new(this.clone(), claim, header);
        match self.registry.dispatch(msg) {
            Ok(()) => Counters::bump(&self.counters.rx_messages),
            Err(RpmsgError::Unreachable(dst)) => {
                Counters::bump(&self.counters.unreachable);
                tracing::warn!(
                    link_id = self.link_id,
                    dst,
                    src = header.src,
                    "no endpoint at destination, message dropped"
                );
            }
            Err(e) => {
                tracing::warn!(link_id = self.link_id, error = %e, "dispatch failed");
            }
        }
    }
}

impl Isr for Core {
    fn on_notify(&self, vq_id: u32) {
        if self.is_destroyed() {
            return;
        }
        if vq_id == self.queues.rvq().id() {
            self.drain_rx();
        } else if vq_id == self.queues.tvq().id() {
            self.on_tx_notify();
        } else {
            tracing::warn!(link_id = self.link_id, vq_id, "notification for a foreign virtqueue");
        }
    }
}

fn pool_error(e: PoolError, vq_id: u32) -> RpmsgError {
    match e {
        PoolError::Stale { .. } => RpmsgError::StaleBuffer,
        PoolError::Vring(VringError::DescriptorsExhausted) => RpmsgError::QueueFull { vq_id },
        PoolError::RegionTooSmall {
            required,
            available,
        } => RpmsgError::RegionTooSmall {
            required,
            available,
        },
        PoolError::LayoutOverflow => RpmsgError::InvalidArgument("region size overflows usize"),
        PoolError::Vring(VringError::IndexOutOfRange { .. })
        | PoolError::BadAddress { .. }
        | PoolError::NotOnRing { .. } => {
            RpmsgError::InvalidArgument("peer handed back a descriptor outside the buffer arena")
        }
    }
}

// ============================================================================
// RpmsgLite
// ============================================================================

/// One side of an rpmsg link.
///
/// Cheap to clone; clones share the same instance.
#[derive(Clone)]
pub struct RpmsgLite {
    core: Arc<Core>,
}

impl RpmsgLite {
    /// Initialize `shm` and attach as master.
    ///
    /// Zeroes both vrings, carves the buffers, registers the ISRs and kicks
    /// vring 0 to tell the remote the region is ready.
    pub fn master_init(
        shm: Arc<SharedMemory>,
        link_id: u32,
        config: ShmConfig,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, RpmsgError> {
        let initial = match config.link_policy {
            LinkPolicy::MasterKick => LinkState::Up,
            LinkPolicy::Handshake | LinkPolicy::External => LinkState::Down,
        };
        let this = Self::attach(shm, link_id, config, platform, Role::Master, initial)?;
        this.core.queues.rvq().kick();
        Ok(this)
    }

    /// Attach as remote to a region the master initialized.
    ///
    /// Waits for the link as long as `config.link_timeout` allows.
    pub fn remote_init(
        shm: Arc<SharedMemory>,
        link_id: u32,
        config: ShmConfig,
        platform: Arc<dyn Platform>,
    ) -> Result<Self, RpmsgError> {
        let link_timeout = config.link_timeout;
        let this = Self::attach(shm, link_id, config, platform, Role::Remote, LinkState::Down)?;
        if !link_timeout.is_non_blocking() {
            if let Err(e) = this.wait_for_link_up(link_timeout) {
                // Best effort: the caller never sees this instance.
                let _ = this.deinit();
                return Err(e);
            }
        }
        Ok(this)
    }

    fn attach(
        shm: Arc<SharedMemory>,
        link_id: u32,
        config: ShmConfig,
        platform: Arc<dyn Platform>,
        role: Role,
        initial: LinkState,
    ) -> Result<Self, RpmsgError> {
        config.validate()?;
        let max = platform.highest_link_id().min(u32::MAX >> 1);
        if link_id > max {
            return Err(RpmsgError::InvalidLinkId { link_id, max });
        }

        let queues = create_virtqueue_pair(shm, &config, role, link_id, platform.clone())
            .map_err(|e| pool_error(e, vq_id(link_id, 0)))?;
        let registry = EndpointRegistry::new(config.reserved_addresses);

        let core = Arc::new_cyclic(|me| Core {
            me: me.clone(),
            role,
            link_id,
            config,
            queues,
            registry,
            platform: platform.clone(),
            state: AtomicU8::new(initial as u8),
            counters: Counters::default(),
            rx_busy: AtomicBool::new(false),
            rx_pending: AtomicBool::new(false),
        });

        let ids = [core.queues.rvq().id(), core.queues.tvq().id()];
        for (n, id) in ids.iter().enumerate() {
            let strong: Arc<dyn Isr> = core.clone();
            if let Err(e) = platform.init_interrupt(*id, Arc::downgrade(&strong)) {
                for registered in &ids[..n] {
                    let _ = platform.deinit_interrupt(*registered);
                }
                return Err(e);
            }
        }

        tracing::debug!(
            link_id,
            ?role,
            state = ?initial,
            buffers = core.config.buffer_count,
            buffer_size = core.config.buffer_size(),
            "rpmsg instance attached"
        );
        Ok(Self { core })
    }

    /// Tear the instance down.
    ///
    /// Unregisters both ISRs and drops every endpoint. Any later call fails.
    pub fn deinit(&self) -> Result<(), RpmsgError> {
        let core = &self.core;
        let previous = LinkState::from_u8(
            core.state
                .swap(LinkState::Destroyed as u8, Ordering::AcqRel),
        );
        if previous == LinkState::Destroyed {
            return Err(RpmsgError::Destroyed);
        }

        let mut result = Ok(());
        for id in [core.queues.rvq().id(), core.queues.tvq().id()] {
            if let Err(e) = core.platform.deinit_interrupt(id) {
                tracing::warn!(link_id = core.link_id, vq_id = id, error = %e, "deinit_interrupt failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        core.registry.clear();
        tracing::debug!(link_id = core.link_id, role = ?core.role, "rpmsg instance destroyed");
        result
    }

    // ------------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------------

    /// Bind an endpoint at `addr`, or at the lowest free address when `addr`
    /// is [`ADDR_ANY`](rpmsg_core::ADDR_ANY).
    pub fn create_ept(
        &self,
        addr: u32,
        handler: impl MessageHandler,
    ) -> Result<Endpoint, RpmsgError> {
        self.core.ensure_alive()?;
        let ept = self.core.registry.create(addr, Arc::new(handler))?;
        tracing::debug!(link_id = self.core.link_id, addr = ept.addr(), "endpoint created");
        Ok(ept)
    }

    /// Unbind `ept`. Messages already handed to its handler are unaffected.
    pub fn destroy_ept(&self, ept: Endpoint) -> Result<(), RpmsgError> {
        self.core.ensure_alive()?;
        self.core.registry.destroy(&ept)?;
        tracing::debug!(link_id = self.core.link_id, addr = ept.addr(), "endpoint destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------------

    /// Copy `data` into a transmit buffer and send it from `ept` to `dst`.
    ///
    /// `timeout` bounds the wait for a free buffer only.
    pub fn send(
        &self,
        ept: &Endpoint,
        dst: u32,
        data: &[u8],
        timeout: Timeout,
    ) -> Result<(), RpmsgError> {
        self.core.ensure_alive()?;
        let max = self.core.max_payload();
        if data.len() > max {
            return Err(RpmsgError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }
        self.core.ensure_up()?;

        let mut buf = self.alloc_tx_buffer(timeout)?;
        buf.payload_mut()[..data.len()].copy_from_slice(data);
        self.send_nocopy(ept, dst, buf, data.len())
    }

    /// Take a free transmit buffer, waiting up to `timeout`.
    pub fn alloc_tx_buffer(&self, timeout: Timeout) -> Result<TxBuffer, RpmsgError> {
        let core = &self.core;
        let deadline = timeout.start();
        loop {
            core.ensure_up()?;
            match core.queues.try_alloc_tx() {
                Ok(Some(claim)) => return Ok(TxBuffer::new(core.clone(), claim)),
                Ok(None) => {}
                Err(e) => {
                    // The entry is gone from the ring; try the next one.
                    Counters::bump(&core.counters.corrupt);
                    tracing::warn!(link_id = core.link_id, error = %e, "skipped bad descriptor on tx vring");
                    continue;
                }
            }

            if timeout.is_non_blocking() {
                return Err(RpmsgError::NoBuffers);
            }
            if deadline.expired() {
                return Err(RpmsgError::Timeout(timeout.duration()));
            }
            let nap = match deadline.remaining() {
                Some(left) => left.min(core.config.poll_interval),
                None => core.config.poll_interval,
            };
            core.platform.delay(nap);
        }
    }

    /// Send `len` bytes already written into `buf`.
    ///
    /// On error the buffer goes back to the free list.
    pub fn send_nocopy(
        &self,
        ept: &Endpoint,
        dst: u32,
        buf: TxBuffer,
        len: usize,
    ) -> Result<(), RpmsgError> {
        let core = &self.core;
        core.ensure_alive()?;
        if !Arc::ptr_eq(buf.core(), core) {
            return Err(RpmsgError::StaleBuffer);
        }
        if len > buf.capacity() {
            return Err(RpmsgError::PayloadTooLarge {
                len,
                max: buf.capacity(),
            });
        }
        core.ensure_up()?;

        // len fits: capacity is at most u16::MAX.
        let header = MsgHeader::new(ept.addr(), dst, len as u16, 0);
        let claim = buf.seal(header);
        if let Err(e) = core.queues.enqueue(claim, HEADER_SIZE + len) {
            core.unalloc_tx(claim);
            return Err(pool_error(e, core.queues.tvq().id()));
        }

        Counters::bump(&core.counters.tx_messages);
        tracing::trace!(link_id = core.link_id, src = ept.addr(), dst, len, "tx");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receive
    // ------------------------------------------------------------------------

    /// Give a held receive buffer back to the peer.
    pub fn release_rx_buffer(&self, msg: RxBuffer) -> Result<(), RpmsgError> {
        self.core.ensure_alive()?;
        if !Arc::ptr_eq(msg.core(), &self.core) {
            return Err(RpmsgError::StaleBuffer);
        }
        self.core.release_rx_claim(msg.take_claim())
    }

    /// Drain the receive vring without waiting for a notification.
    ///
    /// Returns how many messages were taken off the ring.
    pub fn poll(&self) -> usize {
        if self.core.is_destroyed() {
            return 0;
        }
        self.core.drain_rx()
    }

    // ------------------------------------------------------------------------
    // Link state
    // ------------------------------------------------------------------------

    #[inline]
    pub fn is_link_up(&self) -> bool {
        self.core.state() == LinkState::Up
    }

    #[inline]
    pub fn link_state(&self) -> LinkState {
        self.core.state()
    }

    /// Wait until the link is up.
    ///
    /// A non-blocking timeout reports the current state at once: `Ok` when
    /// up, `Timeout` otherwise.
    pub fn wait_for_link_up(&self, timeout: Timeout) -> Result<(), RpmsgError> {
        let core = &self.core;
        let deadline = timeout.start();
        loop {
            match core.state() {
                LinkState::Up => return Ok(()),
                LinkState::Destroyed => return Err(RpmsgError::Destroyed),
                LinkState::Down => {}
            }
            if timeout.is_non_blocking() || deadline.expired() {
                return Err(RpmsgError::Timeout(timeout.duration()));
            }
            let nap = match deadline.remaining() {
                Some(left) => left.min(core.config.poll_interval),
                None => core.config.poll_interval,
            };
            core.platform.delay(nap);
        }
    }

    /// Mark the link up, for platforms that learn it out of band.
    pub fn signal_link_up(&self) -> Result<(), RpmsgError> {
        self.core.ensure_alive()?;
        self.core.transition(LinkState::Down, LinkState::Up);
        Ok(())
    }

    /// Mark the link down, e.g. when the peer went away.
    pub fn signal_link_down(&self) -> Result<(), RpmsgError> {
        self.core.ensure_alive()?;
        self.core.transition(LinkState::Up, LinkState::Down);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    #[inline]
    pub fn role(&self) -> Role {
        self.core.role
    }

    #[inline]
    pub fn link_id(&self) -> u32 {
        self.core.link_id
    }

    /// Largest payload one message can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.core.max_payload()
    }

    /// The master's buffer arena; all zero on a remote.
    #[inline]
    pub fn arena(&self) -> ArenaInfo {
        self.core.queues.arena()
    }

    pub fn stats(&self) -> LinkStats {
        self.core.counters.snapshot()
    }

    /// Transmit buffers allocated and not yet sent.
    pub fn tx_outstanding(&self) -> usize {
        self.core.queues.tx_outstanding()
    }

    /// Received buffers held by handlers.
    pub fn rx_outstanding(&self) -> usize {
        self.core.queues.rx_outstanding()
    }

    pub fn endpoint_count(&self) -> usize {
        self.core.registry.len()
    }
}

impl std::fmt::Debug for RpmsgLite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpmsgLite")
            .field("role", &self.core.role)
            .field("link_id", &self.core.link_id)
            .field("state", &self.core.state())
            .field("queues", &self.core.queues)
            .finish()
    }
}
