//! Error type shared by every rpmsg operation.

use std::time::Duration;

use crate::header::HeaderError;

/// Status codes of the C-compatible ABI.
///
/// These are what an rpmsg peer written against the classic C API expects to
/// see when a status crosses a language boundary.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const ERRORS_BASE: i32 = -5000;
    pub const ERR_NO_MEM: i32 = ERRORS_BASE - 1;
    pub const ERR_BUFF_SIZE: i32 = ERRORS_BASE - 2;
    pub const ERR_PARAM: i32 = ERRORS_BASE - 3;
    pub const ERR_DEV_ID: i32 = ERRORS_BASE - 4;
    pub const ERR_MAX_VQ: i32 = ERRORS_BASE - 5;
    pub const ERR_NO_BUFF: i32 = ERRORS_BASE - 6;
    pub const NOT_READY: i32 = ERRORS_BASE - 7;
    pub const ALREADY_DONE: i32 = ERRORS_BASE - 8;
}

/// Coarse classification of an [`RpmsgError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhausted,
    Timeout,
    NotReady,
    AddressInUse,
    Unreachable,
    CorruptMessage,
}

/// Errors returned by rpmsg operations.
#[derive(Debug, thiserror::Error)]
pub enum RpmsgError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("payload of {len} bytes exceeds buffer capacity of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("link id {link_id} exceeds the platform maximum of {max}")]
    InvalidLinkId { link_id: u32, max: u32 },

    #[error("shared memory region too small: need {required} bytes, got {available}")]
    RegionTooSmall { required: usize, available: usize },

    #[error("buffer handle is stale or belongs to another instance")]
    StaleBuffer,

    #[error("no free transmit buffer")]
    NoBuffers,

    #[error("virtqueue {vq_id} has no room for another descriptor")]
    QueueFull { vq_id: u32 },

    #[error("no free endpoint address")]
    AddressSpaceExhausted,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("link is down")]
    NotReady,

    #[error("instance has been deinitialized")]
    Destroyed,

    #[error("endpoint address {0} is already bound")]
    AddressInUse(u32),

    #[error("no endpoint bound at address {0}")]
    Unreachable(u32),

    #[error("corrupt message: {0}")]
    CorruptMessage(#[from] HeaderError),

    #[error("platform error: {0}")]
    Platform(#[from] std::io::Error),
}

impl RpmsgError {
    /// The error kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_)
            | Self::PayloadTooLarge { .. }
            | Self::InvalidLinkId { .. }
            | Self::RegionTooSmall { .. }
            | Self::StaleBuffer => ErrorKind::InvalidArgument,
            Self::NoBuffers | Self::QueueFull { .. } | Self::AddressSpaceExhausted => {
                ErrorKind::ResourceExhausted
            }
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotReady | Self::Destroyed | Self::Platform(_) => ErrorKind::NotReady,
            Self::AddressInUse(_) => ErrorKind::AddressInUse,
            Self::Unreachable(_) => ErrorKind::Unreachable,
            Self::CorruptMessage(_) => ErrorKind::CorruptMessage,
        }
    }

    /// The status code a C peer would report for this error.
    ///
    /// The C ABI has no dedicated timeout status; an allocation that runs out
    /// of time reports out-of-memory.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) | Self::StaleBuffer | Self::Unreachable(_) => codes::ERR_PARAM,
            Self::RegionTooSmall { .. } => codes::ERR_PARAM,
            Self::PayloadTooLarge { .. } | Self::CorruptMessage(_) => codes::ERR_BUFF_SIZE,
            Self::InvalidLinkId { .. } => codes::ERR_DEV_ID,
            Self::NoBuffers | Self::AddressSpaceExhausted | Self::Timeout(_) => codes::ERR_NO_MEM,
            Self::QueueFull { .. } => codes::ERR_NO_BUFF,
            Self::NotReady | Self::Destroyed | Self::Platform(_) => codes::NOT_READY,
            Self::AddressInUse(_) => codes::ALREADY_DONE,
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            RpmsgError::PayloadTooLarge { len: 497, max: 496 }.kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(RpmsgError::NoBuffers.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(RpmsgError::Destroyed.kind(), ErrorKind::NotReady);
        assert_eq!(
            RpmsgError::from(HeaderError::Truncated { len: 3 }).kind(),
            ErrorKind::CorruptMessage
        );
        assert!(RpmsgError::Timeout(Duration::from_millis(5)).is_timeout());
    }

    #[test]
    fn test_abi_codes() {
        assert_eq!(codes::ERR_NO_MEM, -5001);
        assert_eq!(codes::ALREADY_DONE, -5008);
        assert_eq!(
            RpmsgError::PayloadTooLarge { len: 1, max: 0 }.code(),
            codes::ERR_BUFF_SIZE
        );
        assert_eq!(
            RpmsgError::InvalidLinkId { link_id: 9, max: 1 }.code(),
            codes::ERR_DEV_ID
        );
        assert_eq!(RpmsgError::NotReady.code(), codes::NOT_READY);
    }

    #[test]
    fn test_display() {
        let e = RpmsgError::AddressInUse(10);
        assert_eq!(e.to_string(), "endpoint address 10 is already bound");
    }
}
