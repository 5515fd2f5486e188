//! eventfd-based poller wakeup.
//!
//! Several `wake()` calls before the poller drains the eventfd coalesce into
//! a single wakeup (eventfd counter semantics).

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use crate::sys;

pub(crate) struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self { fd: sys::eventfd()? })
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        sys::eventfd_signal(self.fd())
    }

    /// Reset after the poller observed the wakeup.
    pub(crate) fn drain(&self) {
        sys::eventfd_drain(self.fd());
    }
}
