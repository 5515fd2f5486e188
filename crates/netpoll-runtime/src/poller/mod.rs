//! Poller: one epoll instance driven by one dedicated thread.
//!
//! ```text
//!   ┌──────────── poller thread ─────────────┐
//!   │ loop {                                  │
//!   │   epoll_wait(timeout)                   │
//!   │   for (token, flags) in events {        │
//!   │     op = registry[token]   (or skip)    │
//!   │     op.enter() -> handler callbacks     │
//!   │     op.exit()                           │
//!   │   }                                     │
//!   │ }                                       │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! `register`, `modify` and `deregister` may be called from any thread.
//! `deregister` returns only after any in-flight callback of that operator
//! has finished; called from the poller's own thread (i.e. from inside a
//! callback) it does not wait, since the only callback in flight is the
//! caller itself.

mod operator;
mod waker;

pub use operator::{FdHandler, FdOperator, Interest};

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};

use netpoll_core::{NetpollError, Result};
use tracing::{debug, error, trace};

use crate::config::NetpollConfig;
use crate::sync::{lock, Latch};
use crate::sys;
use waker::Waker;

/// Token reserved for the waker eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

const HUP_EVENTS: u32 = (libc::EPOLLHUP | libc::EPOLLERR) as u32;
const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;

pub struct Poller {
    index: usize,
    epfd: OwnedFd,
    waker: Waker,
    registry: Mutex<HashMap<u64, Arc<FdOperator>>>,
    running: AtomicBool,
    thread: OnceLock<ThreadId>,
    events_capacity: usize,
    timeout_ms: i32,
}

impl Poller {
    pub(crate) fn new(index: usize, config: &NetpollConfig) -> io::Result<Self> {
        let epfd = sys::epoll_create()?;
        let waker = Waker::new()?;
        sys::epoll_ctl(
            epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.fd(),
            libc::EPOLLIN as u32,
            WAKE_TOKEN,
        )?;
        Ok(Self {
            index,
            epfd,
            waker,
            registry: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            thread: OnceLock::new(),
            events_capacity: config.events_capacity.max(1),
            timeout_ms: config.poll_timeout_ms(),
        })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Operators currently registered.
    pub fn operator_count(&self) -> usize {
        lock(&self.registry).len()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start delivering events for `op`.
    pub fn register(&self, op: &Arc<FdOperator>) -> Result<()> {
        if !op.claim_registration() {
            return Err(NetpollError::PollerRegistrationFailed(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "operator already registered",
            )));
        }
        lock(&self.registry).insert(op.token(), Arc::clone(op));
        let events = op.interest().epoll_events(op.is_oneshot());
        if let Err(e) = sys::epoll_ctl(
            self.epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            op.fd(),
            events,
            op.token(),
        ) {
            lock(&self.registry).remove(&op.token());
            op.unclaim_registration();
            return Err(NetpollError::PollerRegistrationFailed(e));
        }
        trace!(poller = self.index, token = op.token(), fd = op.fd(), "operator registered");
        Ok(())
    }

    /// Change the interest set of a registered operator.
    ///
    /// A no-op once the operator is detached.
    pub fn modify(&self, op: &FdOperator, interest: Interest) -> io::Result<()> {
        op.set_interest(interest);
        if op.is_detached() {
            return Ok(());
        }
        match sys::epoll_ctl(
            self.epfd.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            op.fd(),
            interest.epoll_events(op.is_oneshot()),
            op.token(),
        ) {
            // Raced with deregistration.
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    /// Stop delivering events for `op` and wait out an in-flight callback.
    ///
    /// Idempotent. The descriptor must still be open when this is called.
    pub fn deregister(&self, op: &FdOperator) -> Result<()> {
        if !op.detach() {
            return Ok(());
        }
        let res = sys::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, op.fd(), 0, 0);
        lock(&self.registry).remove(&op.token());
        if !self.on_loop_thread() {
            op.wait_idle();
        }
        trace!(poller = self.index, token = op.token(), fd = op.fd(), "operator deregistered");
        match res {
            Ok(()) => Ok(()),
            // Never added, or already removed by the kernel.
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => Ok(()),
            Err(e) => Err(NetpollError::Io(e)),
        }
    }

    /// True when called from this poller's own thread.
    pub fn on_loop_thread(&self) -> bool {
        self.thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!(poller = self.index, error = %e, "poller wake failed");
        }
    }

    /// Ask the loop to exit after the current dispatch round.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake();
    }

    /// Event loop body. Runs until [`stop`](Self::stop), then counts down
    /// `latch`.
    pub(crate) fn run(self: Arc<Self>, latch: Arc<Latch>) {
        let _ = self.thread.set(thread::current().id());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.events_capacity];
        debug!(poller = self.index, "poller started");

        while self.running.load(Ordering::Acquire) {
            let n = match sys::epoll_wait(self.epfd.as_raw_fd(), &mut events, self.timeout_ms) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(poller = self.index, error = %e, "epoll_wait failed");
                    break;
                }
            };
            for ev in &events[..n] {
                let token = ev.u64;
                let flags = ev.events;
                if token == WAKE_TOKEN {
                    self.waker.drain();
                    continue;
                }
                self.dispatch(token, flags);
            }
        }

        debug!(poller = self.index, "poller stopped");
        latch.count_down();
    }

    fn dispatch(&self, token: u64, flags: u32) {
        let op = lock(&self.registry).get(&token).cloned();
        let Some(op) = op else {
            trace!(poller = self.index, token, "event for removed operator dropped");
            return;
        };
        if !op.enter() {
            return;
        }
        if let Some(handler) = op.handler() {
            trace!(poller = self.index, token, flags, "dispatch");
            if flags & READ_EVENTS != 0 {
                handler.on_readable();
            }
            if flags & WRITE_EVENTS != 0 && !op.is_detached() {
                handler.on_writable();
            }
            if flags & HUP_EVENTS != 0 && !op.is_detached() {
                handler.on_hangup();
            }
        }
        op.exit();
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("index", &self.index)
            .field("running", &self.is_running())
            .field("operators", &self.operator_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{FromRawFd, RawFd};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::Weak;
    use std::time::{Duration, Instant};

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) },
            0
        );
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn spawn_poller() -> (Arc<Poller>, Arc<Latch>) {
        let config = NetpollConfig::new().poll_timeout(Duration::from_millis(10));
        let poller = Arc::new(Poller::new(0, &config).unwrap());
        let latch = Arc::new(Latch::new(1));
        {
            let poller = poller.clone();
            let latch = latch.clone();
            thread::spawn(move || poller.run(latch));
        }
        (poller, latch)
    }

    fn write_byte(fd: RawFd) {
        let b = [1u8];
        assert_eq!(unsafe { libc::write(fd, b.as_ptr() as *const _, 1) }, 1);
    }

    struct Counting {
        fd: RawFd,
        reads: AtomicUsize,
    }

    impl FdHandler for Counting {
        fn on_readable(&self) {
            let mut buf = [0u8; 64];
            let _ = sys::read(self.fd, &mut buf);
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_dispatch_readable() {
        let (poller, latch) = spawn_poller();
        let (r, w) = pipe();
        let handler = Arc::new(Counting { fd: r.as_raw_fd(), reads: AtomicUsize::new(0) });
        let weak: Weak<Counting> = Arc::downgrade(&handler);
        let op = Arc::new(FdOperator::new(r.as_raw_fd(), Interest::READ, weak));
        poller.register(&op).unwrap();
        assert_eq!(poller.operator_count(), 1);

        write_byte(w.as_raw_fd());
        assert!(wait_for(|| handler.reads.load(Ordering::SeqCst) >= 1));

        poller.deregister(&op).unwrap();
        assert_eq!(poller.operator_count(), 0);
        let before = handler.reads.load(Ordering::SeqCst);
        write_byte(w.as_raw_fd());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(handler.reads.load(Ordering::SeqCst), before);

        poller.stop();
        assert!(latch.wait_until(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn test_double_register_rejected() {
        let (poller, _latch) = spawn_poller();
        let (r, _w) = pipe();
        let handler = Arc::new(Counting { fd: r.as_raw_fd(), reads: AtomicUsize::new(0) });
        let weak: Weak<Counting> = Arc::downgrade(&handler);
        let op = Arc::new(FdOperator::new(r.as_raw_fd(), Interest::READ, weak));
        poller.register(&op).unwrap();
        assert!(matches!(
            poller.register(&op),
            Err(NetpollError::PollerRegistrationFailed(_))
        ));
        poller.deregister(&op).unwrap();
        poller.deregister(&op).unwrap();
        poller.stop();
    }

    #[test]
    fn test_register_bad_fd_fails() {
        let (poller, _latch) = spawn_poller();
        let handler = Arc::new(Counting { fd: -1, reads: AtomicUsize::new(0) });
        let weak: Weak<Counting> = Arc::downgrade(&handler);
        let op = Arc::new(FdOperator::new(-1, Interest::READ, weak));
        assert!(matches!(
            poller.register(&op),
            Err(NetpollError::PollerRegistrationFailed(_))
        ));
        assert_eq!(poller.operator_count(), 0);
        poller.stop();
    }

    struct Slow {
        fd: RawFd,
        started: Mutex<Option<mpsc::Sender<()>>>,
        finished: AtomicBool,
    }

    impl FdHandler for Slow {
        fn on_readable(&self) {
            let mut buf = [0u8; 8];
            let _ = sys::read(self.fd, &mut buf);
            if let Some(tx) = lock(&self.started).take() {
                let _ = tx.send(());
            }
            thread::sleep(Duration::from_millis(100));
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_deregister_waits_for_inflight_callback() {
        let (poller, _latch) = spawn_poller();
        let (r, w) = pipe();
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(Slow {
            fd: r.as_raw_fd(),
            started: Mutex::new(Some(tx)),
            finished: AtomicBool::new(false),
        });
        let weak: Weak<Slow> = Arc::downgrade(&handler);
        let op = Arc::new(FdOperator::new(r.as_raw_fd(), Interest::READ, weak));
        poller.register(&op).unwrap();

        write_byte(w.as_raw_fd());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        poller.deregister(&op).unwrap();
        assert!(handler.finished.load(Ordering::SeqCst));
        poller.stop();
    }

    #[test]
    fn test_modify_after_deregister_is_noop() {
        let (poller, _latch) = spawn_poller();
        let (r, _w) = pipe();
        let handler = Arc::new(Counting { fd: r.as_raw_fd(), reads: AtomicUsize::new(0) });
        let weak: Weak<Counting> = Arc::downgrade(&handler);
        let op = Arc::new(FdOperator::new(r.as_raw_fd(), Interest::READ, weak));
        poller.register(&op).unwrap();
        poller.deregister(&op).unwrap();
        poller.modify(&op, Interest::BOTH).unwrap();
        assert_eq!(op.interest(), Interest::BOTH);
        poller.stop();
    }
}
