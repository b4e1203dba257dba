//! Static link configuration.

use std::time::Duration;

use rpmsg_core::{
    RpmsgError, Timeout, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_PAYLOAD_SIZE,
    DEFAULT_RESERVED_ADDRESSES, HEADER_SIZE,
};

use crate::layout::RegionLayout;

/// Default alignment of a vring's used ring.
pub const DEFAULT_VRING_ALIGN: usize = 0x1000;

/// How the link goes from down to up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPolicy {
    /// Master is up once initialized and kicks vring 0; the remote comes up
    /// on that first kick.
    #[default]
    MasterKick,
    /// Like `MasterKick`, but the master waits for the remote to kick back
    /// on vring 1 once it is up.
    Handshake,
    /// Both sides start down; the platform calls `signal_link_up`.
    External,
}

/// Configuration shared by both sides of a link.
///
/// Master and remote must be built with identical buffer and vring settings;
/// nothing on the wire negotiates them.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Buffers per direction. Power of two.
    pub buffer_count: u16,
    /// Usable payload bytes per buffer.
    pub buffer_payload_size: usize,
    /// Alignment of each vring's used ring. Power of two.
    pub vring_align: usize,
    /// Physical address of the region base, as written into descriptors.
    pub pa_base: u64,
    /// Sleep between polls while blocked.
    pub poll_interval: Duration,
    /// Kick the peer every time a received buffer goes back to the ring.
    pub notify_consumed_buffers: bool,
    /// Zero buffers before they go back to the ring.
    pub clear_used_buffers: bool,
    pub link_policy: LinkPolicy,
    /// Endpoint addresses below this are never auto-assigned.
    pub reserved_addresses: u32,
    /// How long `remote_init` waits for the link.
    pub link_timeout: Timeout,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_payload_size: DEFAULT_BUFFER_PAYLOAD_SIZE,
            vring_align: DEFAULT_VRING_ALIGN,
            pa_base: 0,
            poll_interval: Duration::from_millis(1),
            notify_consumed_buffers: true,
            clear_used_buffers: false,
            link_policy: LinkPolicy::MasterKick,
            reserved_addresses: DEFAULT_RESERVED_ADDRESSES,
            link_timeout: Timeout::NonBlocking,
        }
    }
}

impl ShmConfig {
    pub fn with_buffer_count(mut self, count: u16) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn with_buffer_payload_size(mut self, size: usize) -> Self {
        self.buffer_payload_size = size;
        self
    }

    pub fn with_vring_align(mut self, align: usize) -> Self {
        self.vring_align = align;
        self
    }

    pub fn with_pa_base(mut self, pa_base: u64) -> Self {
        self.pa_base = pa_base;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_notify_consumed_buffers(mut self, on: bool) -> Self {
        self.notify_consumed_buffers = on;
        self
    }

    pub fn with_clear_used_buffers(mut self, on: bool) -> Self {
        self.clear_used_buffers = on;
        self
    }

    pub fn with_link_policy(mut self, policy: LinkPolicy) -> Self {
        self.link_policy = policy;
        self
    }

    pub fn with_reserved_addresses(mut self, reserved: u32) -> Self {
        self.reserved_addresses = reserved;
        self
    }

    pub fn with_link_timeout(mut self, timeout: Timeout) -> Self {
        self.link_timeout = timeout;
        self
    }

    /// Bytes per buffer: header plus payload, rounded up to a word.
    pub fn buffer_size(&self) -> usize {
        (HEADER_SIZE + self.buffer_payload_size + 3) & !3
    }

    /// Check the settings are usable.
    pub fn validate(&self) -> Result<(), RpmsgError> {
        if self.buffer_count == 0 || !self.buffer_count.is_power_of_two() {
            return Err(RpmsgError::InvalidArgument(
                "buffer_count must be a non-zero power of two",
            ));
        }
        if self.buffer_count > 1 << 14 {
            return Err(RpmsgError::InvalidArgument("buffer_count is too large"));
        }
        if self.buffer_payload_size == 0 || self.buffer_payload_size > u16::MAX as usize {
            return Err(RpmsgError::InvalidArgument(
                "buffer_payload_size must be between 1 and 65535",
            ));
        }
        if self.vring_align < 4 || !self.vring_align.is_power_of_two() {
            return Err(RpmsgError::InvalidArgument(
                "vring_align must be a power of two of at least 4",
            ));
        }
        let fits = RegionLayout::calculate(self)
            .ok()
            .and_then(|layout| u64::try_from(layout.total_size).ok())
            .and_then(|total| self.pa_base.checked_add(total))
            .is_some();
        if !fits {
            return Err(RpmsgError::InvalidArgument(
                "region does not fit above pa_base",
            ));
        }
        Ok(())
    }

    /// Bytes a shared region needs for this configuration.
    pub fn region_size(&self) -> Result<usize, RpmsgError> {
        self.validate()?;
        RegionLayout::calculate(self)
            .map(|layout| layout.total_size)
            .map_err(|_| RpmsgError::InvalidArgument("region size overflows usize"))
    }
}
