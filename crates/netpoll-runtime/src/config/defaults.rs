//! Library defaults for [`NetpollConfig`](super::NetpollConfig).

use netpoll_core::block_pool;

/// Upper bound for CPU-derived thread counts.
pub const MAX_AUTO_THREADS: usize = 8;

/// Poller wait bound in milliseconds.
pub const POLL_TIMEOUT_MS: u64 = 100;

/// Events fetched per `epoll_wait`.
pub const EVENTS_CAPACITY: usize = 1024;

pub const BLOCK_SIZE: usize = block_pool::DEFAULT_BLOCK_SIZE;

pub const BLOCK_POOL_CAPACITY: usize = block_pool::DEFAULT_POOL_CAPACITY;

/// Hook worker idle park in microseconds.
pub const HOOK_PARK_US: u64 = 1000;

pub const LISTEN_BACKLOG: i32 = 1024;

/// Default dial timeout in milliseconds.
pub const DIAL_TIMEOUT_MS: u64 = 5000;

/// Available parallelism, at least 1 and at most [`MAX_AUTO_THREADS`].
pub fn auto_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .clamp(1, MAX_AUTO_THREADS)
}

pub fn num_pollers() -> usize {
    auto_threads()
}

pub fn hook_workers() -> usize {
    auto_threads()
}
