//! `TaskPool`: fixed set of threads running connection hook tasks.
//!
//! Pollers never call user hooks directly. They push a task here and go
//! back to waiting on epoll. Workers pop from a lock-free queue and park
//! briefly when it is empty; `submit` unparks one worker round-robin.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use tracing::{debug, error, warn};

use crate::sync::{lock, Latch};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TaskPool {
    inner: Arc<PoolInner>,
    workers: Vec<thread::Thread>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next: AtomicUsize,
    latch: Arc<Latch>,
}

struct PoolInner {
    queue: SegQueue<Task>,
    shutdown: AtomicBool,
    idle_park: Duration,
}

impl TaskPool {
    pub(crate) fn new(n: usize, idle_park: Duration) -> io::Result<Self> {
        let n = n.max(1);
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            idle_park,
        });
        let latch = Arc::new(Latch::new(n));

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner_ref = Arc::clone(&inner);
            let latch_ref = Arc::clone(&latch);
            let spawned = thread::Builder::new()
                .name(format!("netpoll-hook-{}", worker_id))
                .spawn(move || worker_loop(inner_ref, latch_ref));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    inner.shutdown.store(true, Ordering::SeqCst);
                    for h in &handles {
                        h.thread().unpark();
                    }
                    return Err(e);
                }
            }
        }
        let workers = handles.iter().map(|h| h.thread().clone()).collect();

        Ok(Self {
            inner,
            workers,
            handles: Mutex::new(handles),
            next: AtomicUsize::new(0),
            latch,
        })
    }

    /// Queue a task. Returns false once the pool is shut down.
    pub(crate) fn submit(&self, task: Task) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.inner.queue.push(task);
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[idx].unpark();
        true
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers once the queue is empty.
    /// Returns false if some worker was still busy at `deadline`.
    pub(crate) fn shutdown(&self, deadline: Instant) -> bool {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return true;
        }
        for w in &self.workers {
            w.unpark();
        }
        if !self.latch.wait_until(deadline) {
            warn!(busy = self.latch.count(), "hook workers still running at deadline");
            return false;
        }
        for h in lock(&self.handles).drain(..) {
            let _ = h.join();
        }
        // Pushed after the workers exited.
        while self.inner.queue.pop().is_some() {}
        debug!("hook pool stopped");
        true
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for w in &self.workers {
            w.unpark();
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, latch: Arc<Latch>) {
    loop {
        match inner.queue.pop() {
            Some(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("hook task panicked");
                }
            }
            None if inner.shutdown.load(Ordering::Acquire) => break,
            None => thread::park_timeout(inner.idle_park),
        }
    }
    latch.count_down();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_run() {
        let pool = TaskPool::new(2, Duration::from_millis(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(pool.submit(Box::new(move || tx.send(i).unwrap())));
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        assert!(pool.shutdown(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let pool = TaskPool::new(1, Duration::from_millis(1)).unwrap();
        pool.submit(Box::new(|| panic!("hook bug")));
        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(pool.shutdown(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_runs_queued_tasks() {
        let pool = TaskPool::new(1, Duration::from_millis(1)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(pool.shutdown(Instant::now() + Duration::from_secs(5)));
        assert_eq!(ran.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = TaskPool::new(1, Duration::from_millis(1)).unwrap();
        assert!(pool.shutdown(Instant::now() + Duration::from_secs(5)));
        assert!(pool.is_shutdown());
        assert!(!pool.submit(Box::new(|| {})));
    }

    #[test]
    fn test_shutdown_deadline_with_busy_worker() {
        let pool = TaskPool::new(1, Duration::from_millis(1)).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = rx.recv_timeout(Duration::from_secs(5));
        }));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!pool.shutdown(Instant::now() + Duration::from_millis(20)));
        drop(tx);
    }
}
