//! rpmsg-core: pieces every rpmsg transport agrees on.
//!
//! - the 16-byte message header and its codec
//! - the error type and its C status codes
//! - timeouts for blocking calls
//! - the [`Platform`] capabilities a transport is driven by

#![forbid(unsafe_code)]

mod error;
mod header;
mod platform;
mod timeout;

pub use error::{codes, ErrorKind, RpmsgError};
pub use header::{
    decode_header, encode_header, HeaderError, MsgHeader, Reserved, HEADER_FORMAT_VERSION,
    HEADER_SIZE,
};
pub use platform::{link_id_of, queue_of, vq_id, Isr, Platform};
pub use timeout::{Deadline, Timeout};

/// Endpoint address meaning "pick one for me".
pub const ADDR_ANY: u32 = 0xFFFF_FFFF;

/// Addresses below this are never handed out automatically.
pub const DEFAULT_RESERVED_ADDRESSES: u32 = 1024;

/// Default usable payload bytes per buffer.
pub const DEFAULT_BUFFER_PAYLOAD_SIZE: usize = 496;

/// Default buffer count per direction.
pub const DEFAULT_BUFFER_COUNT: u16 = 2;
