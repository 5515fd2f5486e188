//! FD operators: the binding of one descriptor to its readiness callbacks.

use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Readiness interest of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);
    pub const BOTH: Interest = Interest(0b11);

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub(crate) fn epoll_events(self, oneshot: bool) -> u32 {
        let mut ev = 0u32;
        if self.is_readable() {
            ev |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.is_writable() {
            ev |= libc::EPOLLOUT as u32;
        }
        if oneshot {
            ev |= libc::EPOLLONESHOT as u32;
        }
        ev
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Callbacks a poller invokes for a registered descriptor.
///
/// **Contract:** for one operator the poller thread never runs two of these
/// concurrently, and none starts after [`Poller::deregister`] returned.
///
/// [`Poller::deregister`]: super::Poller::deregister
pub trait FdHandler: Send + Sync {
    /// EPOLLIN / EPOLLRDHUP
    fn on_readable(&self) {}

    /// EPOLLOUT
    fn on_writable(&self) {}

    /// EPOLLHUP / EPOLLERR
    fn on_hangup(&self) {}
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Registration record for one descriptor.
///
/// The poller registry is keyed by `token`, never by the descriptor number,
/// so an event queued for a removed operator can not reach a new owner of a
/// recycled descriptor. The handler is held weakly: the owner keeps the
/// operator alive, not the other way round.
pub struct FdOperator {
    token: u64,
    fd: RawFd,
    interest: AtomicU8,
    oneshot: bool,
    handler: Weak<dyn FdHandler>,
    /// Dispatches currently inside a callback.
    inflight: AtomicUsize,
    detached: AtomicBool,
    registered: AtomicBool,
}

impl FdOperator {
    pub fn new(fd: RawFd, interest: Interest, handler: Weak<dyn FdHandler>) -> Self {
        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            fd,
            interest: AtomicU8::new(interest.0),
            oneshot: false,
            handler,
            inflight: AtomicUsize::new(0),
            detached: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        }
    }

    /// Deliver at most one event (EPOLLONESHOT).
    pub fn oneshot(mut self) -> Self {
        self.oneshot = true;
        self
    }

    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> Interest {
        Interest(self.interest.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_oneshot(&self) -> bool {
        self.oneshot
    }

    #[inline]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn set_interest(&self, interest: Interest) {
        self.interest.store(interest.0, Ordering::Release);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn FdHandler>> {
        self.handler.upgrade()
    }

    /// Claim the one registration this operator may have.
    pub(crate) fn claim_registration(&self) -> bool {
        !self.registered.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn unclaim_registration(&self) {
        self.registered.store(false, Ordering::Release);
    }

    /// Mark detached. Returns false if it already was.
    pub(crate) fn detach(&self) -> bool {
        !self.detached.swap(true, Ordering::SeqCst)
    }

    /// Begin a dispatch. Fails once detached.
    pub(crate) fn enter(&self) -> bool {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.detached.load(Ordering::SeqCst) {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// End a dispatch started by a successful [`enter`](Self::enter).
    pub(crate) fn exit(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "operator {} exited without entering", self.token);
    }

    /// Spin until no dispatch is inside a callback.
    pub(crate) fn wait_idle(&self) {
        let mut spins = 0u32;
        while self.inflight.load(Ordering::SeqCst) != 0 {
            if spins < 64 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl std::fmt::Debug for FdOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdOperator")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("interest", &self.interest())
            .field("oneshot", &self.oneshot)
            .field("detached", &self.is_detached())
            .finish()
    }
}
