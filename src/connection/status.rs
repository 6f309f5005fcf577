// src/connection/status.rs

//! The lifecycle state of a `ClientConnection`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a connection is in its lifecycle. States only ever move forward:
/// `Unconnected -> Connecting -> {Connected | Ended}`, `Connected -> Ended`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectStatus {
    Unconnected = 0,
    Connecting = 1,
    Connected = 2,
    Ended = 3,
}

impl ConnectStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Ended,
        }
    }
}

impl fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a `ConnectStatus`, readable from any thread.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectStatus::Unconnected as u8))
    }

    pub(crate) fn get(&self) -> ConnectStatus {
        ConnectStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if that is a forward transition. Returns false, leaving the
    /// state untouched, otherwise.
    pub(crate) fn advance(&self, next: ConnectStatus) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }
}
