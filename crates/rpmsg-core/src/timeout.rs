//! Timeouts for calls that may wait on the peer.

use std::time::{Duration, Instant};

/// How long a call may wait for a buffer or for the link to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    /// Check once and return.
    #[default]
    NonBlocking,
    /// Wait at most this long.
    After(Duration),
    /// Wait until the condition holds.
    Forever,
}

impl Timeout {
    /// Millisecond timeout in the C convention: `0` never blocks and
    /// `u32::MAX` blocks forever.
    pub const fn from_millis(ms: u32) -> Self {
        match ms {
            0 => Self::NonBlocking,
            u32::MAX => Self::Forever,
            ms => Self::After(Duration::from_millis(ms as u64)),
        }
    }

    #[inline]
    pub fn is_non_blocking(&self) -> bool {
        matches!(self, Self::NonBlocking) || *self == Self::After(Duration::ZERO)
    }

    /// The duration reported in a timeout error.
    pub fn duration(&self) -> Duration {
        match self {
            Self::NonBlocking => Duration::ZERO,
            Self::After(d) => *d,
            Self::Forever => Duration::MAX,
        }
    }

    /// Start counting down from now.
    pub fn start(self) -> Deadline {
        let at = match self {
            Self::NonBlocking => Some(Instant::now()),
            Self::After(d) => Some(Instant::now().checked_add(d).unwrap_or_else(far_future)),
            Self::Forever => None,
        };
        Deadline { timeout: self, at }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Self::NonBlocking
        } else {
            Self::After(d)
        }
    }
}

fn far_future() -> Instant {
    // Roughly 30 years; Instant has no MAX.
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// A running timeout.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: Timeout,
    at: Option<Instant>,
}

impl Deadline {
    /// Whether the wait is over.
    #[inline]
    pub fn expired(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left, or `None` when waiting forever.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The timeout this deadline was started from.
    #[inline]
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }
}
