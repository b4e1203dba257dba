//! Owned handles to buffers in the shared arena.

use std::sync::Arc;

use rpmsg_core::{MsgHeader, HEADER_SIZE};

use crate::instance::Core;
use crate::pool::BufferClaim;

/// A transmit buffer from `alloc_tx_buffer`.
///
/// Fill [`payload_mut`](Self::payload_mut) and pass it to `send_nocopy`.
/// Dropped unsent, it goes back to the local free list.
pub struct TxBuffer {
    core: Arc<Core>,
    claim: BufferClaim,
    /// Cleared once the claim has been handed on.
    live: bool,
    capacity: usize,
}

impl TxBuffer {
    pub(crate) fn new(core: Arc<Core>, claim: BufferClaim) -> Self {
        let capacity = core.max_payload();
        Self {
            core,
            claim,
            live: true,
            capacity,
        }
    }

    /// Payload bytes this buffer can carry.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: we hold the descriptor; the peer does not touch the buffer.
        unsafe {
            self.core
                .shm()
                .slice(self.claim.offset + HEADER_SIZE, self.capacity)
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: we hold the descriptor and `&mut self` rules out aliases.
        unsafe {
            self.core
                .shm()
                .slice_mut(self.claim.offset + HEADER_SIZE, self.capacity)
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Write the header and give up the claim for sending.
    pub(crate) fn seal(mut self, header: MsgHeader) -> BufferClaim {
        // SAFETY: we hold the descriptor and own `self`.
        let bytes = unsafe { self.core.shm().slice_mut(self.claim.offset, HEADER_SIZE) };
        bytes.copy_from_slice(&header.encode());
        self.live = false;
        self.claim
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if self.live {
            self.core.unalloc_tx(self.claim);
        }
    }
}

impl std::fmt::Debug for TxBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxBuffer")
            .field("idx", &self.claim.idx)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// A received message, still sitting in its shared buffer.
///
/// Dropping it returns the buffer to the peer. A handler that keeps it holds
/// the buffer until then.
pub struct RxBuffer {
    core: Arc<Core>,
    claim: BufferClaim,
    live: bool,
    header: MsgHeader,
}

impl RxBuffer {
    pub(crate) fn new(core: Arc<Core>, claim: BufferClaim, header: MsgHeader) -> Self {
        Self {
            core,
            claim,
            live: true,
            header,
        }
    }

    /// Sender endpoint address.
    #[inline]
    pub fn src(&self) -> u32 {
        self.header.src
    }

    /// Destination endpoint address.
    #[inline]
    pub fn dst(&self) -> u32 {
        self.header.dst
    }

    /// Payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    #[inline]
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: we hold the descriptor; the peer does not touch the buffer.
        unsafe {
            self.core
                .shm()
                .slice(self.claim.offset + HEADER_SIZE, self.header.len as usize)
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Give up the claim for an explicit release.
    pub(crate) fn take_claim(mut self) -> BufferClaim {
        self.live = false;
        self.claim
    }
}

impl Drop for RxBuffer {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.core.release_rx_claim(self.claim) {
                tracing::warn!(idx = self.claim.idx, error = %e, "failed to release rx buffer");
            }
        }
    }
}

impl std::fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxBuffer")
            .field("src", &self.header.src)
            .field("dst", &self.header.dst)
            .field("len", &self.header.len)
            .finish()
    }
}
