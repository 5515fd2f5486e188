//! # netpoll - non-blocking I/O core
//!
//! Readiness-driven connections for Linux: a small set of epoll pollers,
//! each on its own thread, fill and drain per-connection zero-copy
//! buffers. Application code reads and writes those buffers and never
//! touches the descriptor.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use netpoll::{create_listener, Connection, EventLoop, HookResult};
//!
//! fn echo(conn: &Connection) -> HookResult {
//!     let n = conn.input_len();
//!     let data = conn.reader()?.next(n)?.into_owned();
//!     conn.write(&data)?;
//!     Ok(())
//! }
//!
//! let event_loop = EventLoop::new(echo)?;
//! let listener = create_listener("tcp", "127.0.0.1:9000")?;
//! event_loop.serve(listener)?; // blocks until shutdown
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      User Code                            │
//! │    OnRequest hook, Dialer, Connection::reader / writer    │
//! └───────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                   netpoll (this crate)                    │
//! │              Public API facade and re-exports             │
//! └───────────────────────────────────────────────────────────┘
//!                             │
//!            ┌────────────────┴────────────────┐
//!            ▼                                 ▼
//! ┌─────────────────────────┐    ┌──────────────────────────────┐
//! │      netpoll-core       │    │       netpoll-runtime        │
//! │  LinkBuffer, BlockPool  │    │  Poller (epoll), EventLoop   │
//! │  ConnState, errors, env │    │  Connection, Dialer, Listener│
//! └─────────────────────────┘    └──────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

pub use netpoll_core::{
    BlockPool, ConnState, LinkBuffer, NetpollError, Result, DEFAULT_BLOCK_SIZE,
    DEFAULT_POOL_CAPACITY,
};
pub use netpoll_runtime::config::{self, NetpollConfig};
pub use netpoll_runtime::{
    new_fd_connection, set_nonblocking, Address, ConnKind, Connection, Dialer, EventLoop,
    EventLoopOptions, HookError, HookResult, Listener, Network, OnConnect, OnDisconnect,
    OnRequest, PollerGroup, Reader, UnixAddr, Writer,
};

/// Low-level poller API, for custom descriptor handlers.
pub mod poller {
    pub use netpoll_runtime::poller::{FdHandler, FdOperator, Interest, Poller};
}

/// Dial `address` on `network` ("tcp", "tcp4", "tcp6" or "unix").
///
/// A zero `timeout` waits until the connect completes or fails.
pub fn dial_connection(
    group: &Arc<PollerGroup>,
    network: &str,
    address: &str,
    timeout: Duration,
) -> Result<Connection> {
    let network: Network = network.parse()?;
    Dialer::new(Arc::clone(group)).dial_timeout(network, address, timeout)
}

/// Bind a listener on `network` ("tcp", "tcp4", "tcp6" or "unix").
pub fn create_listener(network: &str, address: &str) -> Result<Listener> {
    let network: Network = network.parse()?;
    Listener::bind(network, address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_network() {
        assert!(matches!(
            create_listener("udp", "127.0.0.1:0"),
            Err(NetpollError::UnsupportedNetwork(_))
        ));
        let group = PollerGroup::new(NetpollConfig::new().num_pollers(1)).unwrap();
        assert!(matches!(
            dial_connection(&group, "sctp", "127.0.0.1:1", Duration::from_secs(1)),
            Err(NetpollError::UnsupportedNetwork(_))
        ));
        group.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_create_listener_tcp() {
        let l = create_listener("tcp", "127.0.0.1:0").unwrap();
        assert_eq!(l.network(), Network::Tcp);
        assert!(l.local_addr().as_inet().is_some());
    }
}
