//! rpmsg: Lightweight inter-processor messaging over shared memory.
//!
//! Two processor domains that share a memory region exchange discrete
//! messages between numbered endpoints. One side, the master, initializes
//! the region; the other, the remote, attaches to it.
//!
//! # Quick Start
//!
//! ```ignore
//! use rpmsg::prelude::*;
//!
//! let config = ShmConfig::default().with_buffer_count(4);
//! let shm = SharedMemory::new(config.region_size()?)?;
//! let (master_pf, remote_pf) = LoopbackPlatform::pair(Delivery::Immediate);
//!
//! let master = RpmsgLite::master_init(shm.clone(), 0, config.clone(), master_pf)?;
//! let remote = RpmsgLite::remote_init(shm, 0, config, remote_pf)?;
//!
//! let _ept = master.create_ept(10, |msg: RxBuffer| {
//!     println!("{} bytes from {}", msg.len(), msg.src());
//! })?;
//! let src = remote.create_ept(ADDR_ANY, |_msg: RxBuffer| {})?;
//! remote.send(&src, 10, b"hello", Timeout::NonBlocking)?;
//! ```
//!
//! # Platforms
//!
//! Interrupt delivery, barriers and delays come from a [`Platform`]. The
//! shared-memory transport ships two:
//!
//! - **loopback**: master and remote in one process, for tests and demos
//! - **doorbell**: a Unix socketpair per link and a tokio ISR task
//!
//! Implement [`Platform`] to drive a real mailbox or interrupt controller.
//!
//! # Error Handling
//!
//! Every fallible call returns `Result<T, RpmsgError>`. Match on
//! [`RpmsgError::kind`] for the coarse class, or use [`RpmsgError::code`] to
//! report the status a C peer would:
//!
//! ```ignore
//! match remote.send(&src, 10, &payload, Timeout::NonBlocking) {
//!     Ok(()) => {}
//!     Err(e) if e.kind() == ErrorKind::ResourceExhausted => retry_later(),
//!     Err(e) => return Err(e.code()),
//! }
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

pub use rpmsg_core::{
    codes,
    decode_header,
    encode_header,
    // Error types
    ErrorKind,
    HeaderError,
    // Platform capabilities
    Isr,
    // Wire format
    MsgHeader,
    Platform,
    RpmsgError,
    // Timeouts
    Deadline,
    Timeout,
    ADDR_ANY,
    HEADER_SIZE,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use rpmsg::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{ErrorKind, RpmsgError, Timeout, ADDR_ANY};

    #[cfg(feature = "shm")]
    pub use crate::transport::shm::{
        Delivery, Endpoint, LoopbackPlatform, MessageHandler, RpmsgLite, RxBuffer,
        SharedMemory, ShmConfig, TxBuffer,
    };
}

/// Transport implementations.
///
/// Each transport is behind a feature flag.
pub mod transport {
    #[cfg(feature = "shm")]
    pub mod shm {
        pub use rpmsg_transport_shm::*;
    }
}

#[cfg(feature = "shm")]
pub use transport::shm::{Endpoint, LinkState, LinkStats, RpmsgLite, ShmConfig};
