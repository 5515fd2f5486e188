//! Connection lifecycle state
//!
//! ```text
//!   Connecting ──► Active ──► Closing ──► Closed
//!        │                       ▲
//!        └───────────────────────┘   (dial / registration failure)
//! ```
//!
//! Every transition goes through a compare-and-swap on an [`AtomicConnState`],
//! so concurrent closers agree on exactly one winner.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Descriptor exists, handshake or registration not finished
    Connecting = 0,

    /// Registered and usable for reads and writes
    Active = 1,

    /// Teardown requested (locally or by the peer), resources being released
    Closing = 2,

    /// Descriptor released; no further callbacks
    Closed = 3,
}

impl ConnState {
    #[inline]
    pub const fn is_active(&self) -> bool {
        matches!(self, ConnState::Active)
    }

    /// Closing or Closed
    #[inline]
    pub const fn is_shutting_down(&self) -> bool {
        matches!(self, ConnState::Closing | ConnState::Closed)
    }

    /// Whether `self -> next` is a legal edge.
    pub const fn can_transition(&self, next: ConnState) -> bool {
        matches!(
            (self, next),
            (ConnState::Connecting, ConnState::Active)
                | (ConnState::Connecting, ConnState::Closing)
                | (ConnState::Active, ConnState::Closing)
                | (ConnState::Closing, ConnState::Closed)
        )
    }
}

impl From<u8> for ConnState {
    fn from(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Active,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

impl From<ConnState> for u8 {
    fn from(state: ConnState) -> u8 {
        state as u8
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Connecting => "connecting",
            ConnState::Active => "active",
            ConnState::Closing => "closing",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Atomically updated [`ConnState`].
#[derive(Debug)]
pub struct AtomicConnState(AtomicU8);

impl AtomicConnState {
    pub const fn new(state: ConnState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> ConnState {
        ConnState::from(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to` if the current state is `from`.
    ///
    /// Returns false if another thread changed the state first.
    /// Panics on an illegal edge.
    pub fn transition(&self, from: ConnState, to: ConnState) -> bool {
        assert!(
            from.can_transition(to),
            "illegal connection state transition {} -> {}",
            from,
            to
        );
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to Closing from either Connecting or Active.
    ///
    /// Returns the state that was left, or `None` if the connection was
    /// already closing or closed.
    pub fn begin_close(&self) -> Option<ConnState> {
        let mut current = self.load();
        loop {
            if current.is_shutting_down() {
                return None;
            }
            match self.0.compare_exchange(
                current as u8,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(actual) => current = ConnState::from(actual),
            }
        }
    }
}
