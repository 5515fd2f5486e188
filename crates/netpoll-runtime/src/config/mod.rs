//! Runtime configuration
//!
//! Library defaults with environment overrides, plus builder setters.
//!
//! # Example
//!
//! ```rust,ignore
//! use netpoll_runtime::config::NetpollConfig;
//!
//! // Defaults with NETPOLL_* overrides
//! let config = NetpollConfig::from_env();
//!
//! // Or programmatically
//! let config = NetpollConfig::new()
//!     .num_pollers(2)
//!     .poll_timeout(Duration::from_millis(20));
//! ```

pub mod defaults;

use std::io;
use std::time::Duration;

use netpoll_core::env::{env_get, env_get_micros, env_get_millis};
use netpoll_core::{NetpollError, Result};

/// Poller group, buffer and event loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetpollConfig {
    /// Pollers (epoll instances, one thread each) per group
    pub num_pollers: usize,
    /// Bound on a single poller wait
    pub poll_timeout: Duration,
    /// Events fetched per wait
    pub events_capacity: usize,
    /// LinkBuffer block size
    pub block_size: usize,
    /// Free blocks retained by the shared pool
    pub block_pool_capacity: usize,
    /// Threads running request/connect hooks
    pub hook_workers: usize,
    /// Idle park of a hook worker
    pub hook_park: Duration,
    /// Listen backlog
    pub listen_backlog: i32,
    /// Default Dialer timeout. Zero means no timeout.
    pub dial_timeout: Duration,
}

impl Default for NetpollConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl NetpollConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NETPOLL_NUM_POLLERS` - Pollers per group
    /// - `NETPOLL_POLL_TIMEOUT_MS` - Poller wait bound in milliseconds
    /// - `NETPOLL_EVENTS_CAPACITY` - Events per wait
    /// - `NETPOLL_BLOCK_SIZE` - LinkBuffer block size in bytes
    /// - `NETPOLL_BLOCK_POOL_CAPACITY` - Free blocks kept by the pool
    /// - `NETPOLL_HOOK_WORKERS` - Hook worker threads
    /// - `NETPOLL_HOOK_PARK_US` - Hook worker idle park in microseconds
    /// - `NETPOLL_LISTEN_BACKLOG` - Listen backlog
    /// - `NETPOLL_DIAL_TIMEOUT_MS` - Default dial timeout in milliseconds
    pub fn from_env() -> Self {
        Self {
            num_pollers: env_get("NETPOLL_NUM_POLLERS", defaults::num_pollers()),
            poll_timeout: env_get_millis("NETPOLL_POLL_TIMEOUT_MS", defaults::POLL_TIMEOUT_MS),
            events_capacity: env_get("NETPOLL_EVENTS_CAPACITY", defaults::EVENTS_CAPACITY),
            block_size: env_get("NETPOLL_BLOCK_SIZE", defaults::BLOCK_SIZE),
            block_pool_capacity: env_get(
                "NETPOLL_BLOCK_POOL_CAPACITY",
                defaults::BLOCK_POOL_CAPACITY,
            ),
            hook_workers: env_get("NETPOLL_HOOK_WORKERS", defaults::hook_workers()),
            hook_park: env_get_micros("NETPOLL_HOOK_PARK_US", defaults::HOOK_PARK_US),
            listen_backlog: env_get("NETPOLL_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            dial_timeout: env_get_millis("NETPOLL_DIAL_TIMEOUT_MS", defaults::DIAL_TIMEOUT_MS),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            num_pollers: defaults::num_pollers(),
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            events_capacity: defaults::EVENTS_CAPACITY,
            block_size: defaults::BLOCK_SIZE,
            block_pool_capacity: defaults::BLOCK_POOL_CAPACITY,
            hook_workers: defaults::hook_workers(),
            hook_park: Duration::from_micros(defaults::HOOK_PARK_US),
            listen_backlog: defaults::LISTEN_BACKLOG,
            dial_timeout: Duration::from_millis(defaults::DIAL_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn num_pollers(mut self, n: usize) -> Self {
        self.num_pollers = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn events_capacity(mut self, n: usize) -> Self {
        self.events_capacity = n;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn block_pool_capacity(mut self, n: usize) -> Self {
        self.block_pool_capacity = n;
        self
    }

    pub fn hook_workers(mut self, n: usize) -> Self {
        self.hook_workers = n;
        self
    }

    pub fn hook_park(mut self, d: Duration) -> Self {
        self.hook_park = d;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn dial_timeout(mut self, d: Duration) -> Self {
        self.dial_timeout = d;
        self
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |what: &str| {
            Err(NetpollError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid netpoll config: {} must be non-zero", what),
            )))
        };
        if self.num_pollers == 0 {
            return invalid("num_pollers");
        }
        if self.events_capacity == 0 {
            return invalid("events_capacity");
        }
        if self.block_size == 0 {
            return invalid("block_size");
        }
        if self.hook_workers == 0 {
            return invalid("hook_workers");
        }
        if self.poll_timeout.is_zero() {
            return invalid("poll_timeout");
        }
        Ok(())
    }

    /// Poll timeout in epoll milliseconds, at least 1.
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        self.poll_timeout.as_millis().clamp(1, i32::MAX as u128) as i32
    }
}
