//! # netpoll-core
//!
//! Platform-agnostic building blocks of the netpoll I/O core.
//!
//! This crate contains no OS readiness code. The epoll-based pollers,
//! connections and dialer live in `netpoll-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error taxonomy shared by every layer
//! - `state` - Connection lifecycle state machine
//! - `block_pool` - Shared pool of fixed-size buffer blocks
//! - `linkbuffer` - Zero-copy chained buffer used for input and output
//! - `env` - Environment variable helpers for configuration

pub mod block_pool;
pub mod env;
pub mod error;
pub mod linkbuffer;
pub mod state;

// Re-exports for convenience
pub use block_pool::{BlockPool, DEFAULT_BLOCK_SIZE, DEFAULT_POOL_CAPACITY};
pub use env::{env_get, env_get_bool, env_get_micros, env_get_millis, env_get_opt};
pub use error::{NetpollError, Result};
pub use linkbuffer::LinkBuffer;
pub use state::{AtomicConnState, ConnState};
