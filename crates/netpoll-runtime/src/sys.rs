//! Raw Linux syscalls used by pollers and connections.
//!
//! Everything returns `io::Result` with errno mapped through
//! `io::Error::last_os_error()`. Descriptors handed in are borrowed; only
//! [`close`] releases one.

use std::io::{self, IoSlice};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

/// Upper bound on iovecs handed to one vectored write.
pub(crate) const MAX_IOVECS: usize = 64;

#[inline]
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[inline]
fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

// ── epoll ────────────────────────────────────────────────────────────────

pub(crate) fn epoll_create() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
    // SAFETY: epoll_create1 returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn epoll_ctl(
    epfd: RawFd,
    op: libc::c_int,
    fd: RawFd,
    events: u32,
    token: u64,
) -> io::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    cvt(unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) })?;
    Ok(())
}

/// Wait for events. `timeout_ms < 0` blocks indefinitely.
pub(crate) fn epoll_wait(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: i32,
) -> io::Result<usize> {
    let max = events.len().min(i32::MAX as usize) as libc::c_int;
    let n = cvt(unsafe { libc::epoll_wait(epfd, events.as_mut_ptr(), max, timeout_ms) })?;
    Ok(n as usize)
}

// ── eventfd ──────────────────────────────────────────────────────────────

pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
    // SAFETY: eventfd returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Add one to the eventfd counter. A saturated counter already means a
/// wakeup is pending, so EAGAIN is success.
pub(crate) fn eventfd_signal(fd: RawFd) -> io::Result<()> {
    let val: u64 = 1;
    let ret = unsafe {
        libc::write(
            fd,
            &val as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    match cvt_size(ret) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

/// Reset the eventfd counter.
pub(crate) fn eventfd_drain(fd: RawFd) {
    let mut val: u64 = 0;
    unsafe {
        libc::read(
            fd,
            &mut val as *mut u64 as *mut libc::c_void,
            std::mem::size_of::<u64>(),
        );
    }
}

// ── descriptor I/O ───────────────────────────────────────────────────────

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
}

/// Vectored write. Sockets go through `sendmsg(MSG_NOSIGNAL)` so a reset
/// peer yields EPIPE instead of SIGPIPE.
pub(crate) fn write_vectored(fd: RawFd, bufs: &[IoSlice<'_>], socket: bool) -> io::Result<usize> {
    let iovcnt = bufs.len().min(MAX_IOVECS);
    // IoSlice is ABI-compatible with iovec on unix.
    let iov = bufs.as_ptr() as *mut libc::iovec;
    if socket {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iov;
        msg.msg_iovlen = iovcnt as _;
        cvt_size(unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) })
    } else {
        cvt_size(unsafe { libc::writev(fd, iov as *const libc::iovec, iovcnt as libc::c_int) })
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ── descriptor options ───────────────────────────────────────────────────

/// Toggle O_NONBLOCK.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

pub(crate) fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    Ok(OFlag::from_bits_truncate(bits).contains(OFlag::O_NONBLOCK))
}

fn getsockopt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(val)
}

/// Pending socket error (SO_ERROR), cleared by the read.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let err = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if err == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(err)))
    }
}

pub(crate) fn is_socket(fd: RawFd) -> bool {
    getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TYPE).is_ok()
}

/// `io::Error` is not `Clone`; rebuild an equivalent one.
pub(crate) fn clone_error(e: &io::Error) -> io::Error {
    match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    }
}
