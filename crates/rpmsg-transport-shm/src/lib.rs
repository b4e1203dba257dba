//! rpmsg-transport-shm: rpmsg links over a shared memory region.
//!
//! Two processor domains share one region. The master initializes it; the
//! remote attaches to it. Messages move in fixed-size buffers handed back and
//! forth on a pair of split virtqueues, so ownership of a buffer is the only
//! synchronization between the two sides.
//!
//! # Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  vring 0: master rx / remote tx                                      │
//! │    desc[n] | avail ring | pad to vring_align | used ring             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  vring 1: master tx / remote rx                                      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  buffer arena: n master-rx buffers, then n master-tx buffers         │
//! │    each buffer: 16-byte header | payload                             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Descriptor addresses are `pa_base` plus the region offset, so a C peer
//! that sees the region at `pa_base` reads the same rings.
//!
//! # Platforms
//!
//! Interrupts come from a [`Platform`](rpmsg_core::Platform):
//! [`LoopbackPlatform`] for two instances in one process, or
//! [`DoorbellPlatform`] for a socketpair and a tokio ISR task.

pub mod buffer;
pub mod config;
pub mod doorbell;
pub mod endpoint;
pub mod instance;
pub mod layout;
pub mod loopback;
pub mod pool;
pub mod virtqueue;

pub use buffer::{RxBuffer, TxBuffer};
pub use config::{LinkPolicy, ShmConfig, DEFAULT_VRING_ALIGN};
pub use doorbell::{Doorbell, DoorbellPlatform};
pub use endpoint::{Endpoint, MessageHandler};
pub use instance::{LinkState, LinkStats, RpmsgLite};
pub use layout::{vring_size, LayoutError, RegionLayout, SharedMemory, VringLayout};
pub use loopback::{Delivery, LoopbackPlatform};
pub use pool::{create_virtqueue_pair, ArenaInfo, DescState, PoolError, Role, VirtqueuePair};
pub use virtqueue::{RingBuffer, Virtqueue, VringError};
