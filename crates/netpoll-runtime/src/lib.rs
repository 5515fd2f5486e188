//! # netpoll-runtime
//!
//! Linux runtime for the netpoll I/O core.
//!
//! This crate provides:
//! - Pollers: one epoll instance and one thread each, grouped into a
//!   `PollerGroup` with round-robin assignment
//! - Connections with poller-filled input and poller-drained output buffers
//! - A Listener, a Dialer with connect timeouts, and descriptor wrapping
//! - An EventLoop that accepts connections and runs user hooks on a
//!   separate task pool

pub mod config;
mod sync;

pub use config::NetpollConfig;
pub use netpoll_core::{ConnState, NetpollError, Result};

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod sys;
        mod addr;
        pub mod poller;
        mod group;
        mod task;
        mod connection;
        mod listener;
        mod dialer;
        mod event_loop;

        pub use addr::{Address, Network, UnixAddr};
        pub use connection::{new_fd_connection, ConnKind, Connection, Reader, Writer};
        pub use dialer::Dialer;
        pub use event_loop::{
            EventLoop, EventLoopOptions, HookError, HookResult, OnConnect, OnDisconnect, OnRequest,
        };
        pub use group::PollerGroup;
        pub use listener::Listener;
        pub use poller::{FdHandler, FdOperator, Interest, Poller};
        pub use sys::set_nonblocking;
    } else {
        compile_error!("netpoll-runtime supports Linux (epoll) only");
    }
}
