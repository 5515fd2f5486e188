//! PollerGroup: a constructed set of pollers with round-robin assignment.
//!
//! The group owns its poller threads and the block pool shared by every
//! connection registered on it. There is no process-wide instance: whoever
//! needs pollers (an [`EventLoop`](crate::EventLoop), a [`Dialer`](crate::Dialer)
//! user) builds a group and passes it along.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netpoll_core::{BlockPool, NetpollError, Result};
use tracing::{debug, warn};

use crate::config::NetpollConfig;
use crate::poller::Poller;
use crate::sync::{lock, Latch};

pub struct PollerGroup {
    pollers: Vec<Arc<Poller>>,
    next: AtomicUsize,
    pool: Arc<BlockPool>,
    config: NetpollConfig,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    latch: Arc<Latch>,
    stopped: AtomicBool,
}

impl PollerGroup {
    /// Create `config.num_pollers` pollers, each on its own thread.
    pub fn new(config: NetpollConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let n = config.num_pollers;
        let mut pollers = Vec::with_capacity(n);
        for index in 0..n {
            pollers.push(Arc::new(Poller::new(index, &config)?));
        }

        let latch = Arc::new(Latch::new(n));
        let mut handles = Vec::with_capacity(n);
        for poller in &pollers {
            let poller_ref = Arc::clone(poller);
            let latch_ref = Arc::clone(&latch);
            let spawned = thread::Builder::new()
                .name(format!("netpoll-poller-{}", poller.index()))
                .spawn(move || poller_ref.run(latch_ref));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for p in &pollers {
                        p.stop();
                    }
                    return Err(NetpollError::Io(e));
                }
            }
        }

        let pool = Arc::new(BlockPool::new(config.block_size, config.block_pool_capacity));
        debug!(pollers = n, block_size = config.block_size, "poller group started");

        Ok(Arc::new(Self {
            pollers,
            next: AtomicUsize::new(0),
            pool,
            config,
            handles: Mutex::new(handles),
            latch,
            stopped: AtomicBool::new(false),
        }))
    }

    /// Group configured from `NETPOLL_*` environment variables.
    pub fn from_env() -> Result<Arc<Self>> {
        Self::new(NetpollConfig::from_env())
    }

    /// Next poller in round-robin order.
    pub fn pick(&self) -> &Arc<Poller> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pollers.len();
        &self.pollers[idx]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    pub fn pollers(&self) -> &[Arc<Poller>] {
        &self.pollers
    }

    pub fn block_pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    pub fn config(&self) -> &NetpollConfig {
        &self.config
    }

    /// Operators registered across all pollers.
    pub fn operator_count(&self) -> usize {
        self.pollers.iter().map(|p| p.operator_count()).sum()
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop every poller and wait for their threads, at most `timeout`.
    ///
    /// On timeout the remaining threads are left to exit on their own and
    /// `ShutdownTimeout` is returned.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for p in &self.pollers {
            p.stop();
        }
        if !self.latch.wait_until(Instant::now() + timeout) {
            warn!(
                remaining = self.latch.count(),
                "poller group shutdown deadline exceeded"
            );
            return Err(NetpollError::ShutdownTimeout);
        }
        for handle in lock(&self.handles).drain(..) {
            if handle.join().is_err() {
                warn!("poller thread panicked");
            }
        }
        debug!("poller group stopped");
        Ok(())
    }
}

impl Drop for PollerGroup {
    fn drop(&mut self) {
        // Threads exit on their next wakeup; not joined here.
        for p in &self.pollers {
            p.stop();
        }
    }
}

impl std::fmt::Debug for PollerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerGroup")
            .field("pollers", &self.pollers.len())
            .field("stopped", &self.is_shutdown())
            .field("pool", &self.pool)
            .finish()
    }
}

pub(crate) fn io_invalid(msg: &'static str) -> NetpollError {
    NetpollError::Io(io::Error::new(io::ErrorKind::InvalidInput, msg))
}
