//! Connection: a non-blocking descriptor with an input and an output
//! LinkBuffer, driven by one poller.
//!
//! ```text
//!   poller thread                         application thread
//!   ─────────────                         ──────────────────
//!   on_readable: read -> input.flush      reader().wait / next / read
//!   on_writable: output -> sendmsg        writer().write_all ... flush
//!   on_hangup:   teardown                 close -> teardown
//! ```
//!
//! Each direction has its own mutex. The poller fills `input` and drains
//! `output`; the application drains `input` and appends to `output`.
//! A flush first tries an inline vectored write and only arms EPOLLOUT when
//! the kernel buffer is full. `on_writable` disarms it once `output` is
//! empty; both run under the output lock so they agree on whether write
//! interest is armed.
//!
//! Teardown runs once, whichever side triggers it: deregister (waiting out
//! an in-flight callback), close the descriptor, release the buffers, move
//! to Closed, then notify the observer and run close callbacks.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use netpoll_core::{AtomicConnState, BlockPool, ConnState, LinkBuffer, NetpollError, Result};
use tracing::{debug, trace, warn};

use crate::addr::{self, Address};
use crate::group::PollerGroup;
use crate::poller::{FdHandler, FdOperator, Interest, Poller};
use crate::sync::lock;
use crate::sys;

/// Reserved per read call.
const READ_MIN: usize = 1024;
/// Reads per readiness event before yielding back to the poller.
const READ_BURST: usize = 64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// How the descriptor came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    /// Accepted or dialed TCP socket.
    Tcp,
    /// Accepted or dialed unix-domain socket.
    Unix,
    /// Externally created descriptor wrapped by `new_fd_connection`.
    Fd,
}

/// Lifecycle notifications for the owner of a connection (the event loop).
pub(crate) trait ConnObserver: Send + Sync {
    /// New input was flushed into the buffer. Runs on the poller thread.
    fn on_readable(&self, conn: &Connection);

    /// Teardown finished. Runs on whichever thread tore down.
    fn on_closed(&self, conn: &Connection);
}

type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

enum ReadEnd {
    Open,
    Eof,
    Failed(io::Error),
}

struct ConnInner {
    id: u64,
    kind: ConnKind,
    /// -1 once closed.
    fd: AtomicI32,
    is_socket: bool,
    state: AtomicConnState,
    local: Address,
    remote: Address,
    poller: Arc<Poller>,
    op: OnceLock<Arc<FdOperator>>,

    input: Mutex<LinkBuffer>,
    input_cv: Condvar,
    output: Mutex<LinkBuffer>,

    close_requested: AtomicBool,
    torn_down: AtomicBool,
    error: Mutex<Option<io::Error>>,
    observer: Option<Weak<dyn ConnObserver>>,
    close_callbacks: Mutex<Vec<CloseCallback>>,

    /// A hook task is queued or running.
    processing: AtomicBool,
    /// Bumped on every read burst that added input.
    rx_gen: AtomicU64,
    /// The connect hook has finished.
    connected: AtomicBool,
    /// Closed before the connect hook finished; disconnect is owed.
    disconnect_owed: AtomicBool,

    me: Weak<ConnInner>,
}

/// Handle to a connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Wrap `fd`, register it for reads on `poller` and mark it Active.
    pub(crate) fn establish(
        poller: Arc<Poller>,
        pool: &Arc<BlockPool>,
        fd: OwnedFd,
        kind: ConnKind,
        local: Address,
        remote: Address,
        observer: Option<Weak<dyn ConnObserver>>,
    ) -> Result<Connection> {
        let raw = fd.into_raw_fd();
        if let Err(e) = sys::set_nonblocking(raw, true) {
            sys::close(raw);
            return Err(NetpollError::Io(e));
        }
        let has_observer = observer.is_some();
        let inner = Arc::new_cyclic(|me| ConnInner {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            fd: AtomicI32::new(raw),
            is_socket: sys::is_socket(raw),
            state: AtomicConnState::new(ConnState::Connecting),
            local,
            remote,
            poller,
            op: OnceLock::new(),
            input: Mutex::new(LinkBuffer::new(Arc::clone(pool))),
            input_cv: Condvar::new(),
            output: Mutex::new(LinkBuffer::new(Arc::clone(pool))),
            close_requested: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            error: Mutex::new(None),
            observer,
            close_callbacks: Mutex::new(Vec::new()),
            processing: AtomicBool::new(has_observer),
            rx_gen: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            disconnect_owed: AtomicBool::new(false),
            me: me.clone(),
        });

        let weak: Weak<ConnInner> = Arc::downgrade(&inner);
        let handler: Weak<dyn FdHandler> = weak;
        let op = Arc::new(FdOperator::new(raw, Interest::READ, handler));
        let _ = inner.op.set(Arc::clone(&op));

        if let Err(e) = inner.poller.register(&op) {
            inner.state.begin_close();
            inner.teardown();
            return Err(e);
        }
        inner.state.transition(ConnState::Connecting, ConnState::Active);
        debug!(
            conn = inner.id,
            fd = raw,
            kind = ?kind,
            poller = inner.poller.index(),
            remote = %inner.remote,
            "connection open"
        );
        Ok(Connection { inner })
    }

    /// Process-unique connection id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn kind(&self) -> ConnKind {
        self.inner.kind
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.inner.state.load()
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.inner.state.load().is_active()
    }

    pub fn local_addr(&self) -> &Address {
        &self.inner.local
    }

    pub fn remote_addr(&self) -> &Address {
        &self.inner.remote
    }

    /// Underlying descriptor, `None` once closed.
    ///
    /// For socket options only. Reading or writing through it bypasses the
    /// connection buffers.
    pub fn raw_fd(&self) -> Option<RawFd> {
        let fd = self.inner.fd.load(Ordering::Acquire);
        (fd >= 0).then_some(fd)
    }

    /// Toggle O_NONBLOCK on the descriptor.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let fd = self.raw_fd().ok_or(NetpollError::ConnectionClosed)?;
        sys::set_nonblocking(fd, nonblocking)?;
        Ok(())
    }

    pub fn is_nonblocking(&self) -> Result<bool> {
        let fd = self.raw_fd().ok_or(NetpollError::ConnectionClosed)?;
        Ok(sys::is_nonblocking(fd)?)
    }

    /// Error that moved the connection to Closing, if the poller saw one.
    pub fn take_error(&self) -> Option<io::Error> {
        lock(&self.inner.error).take()
    }

    /// Bytes buffered for reading.
    pub fn input_len(&self) -> usize {
        lock(&self.inner.input).readable_len()
    }

    /// Index of the poller driving this connection.
    pub fn poller_index(&self) -> usize {
        self.inner.poller.index()
    }

    /// Run `f` once teardown completes. Fails with `ConnectionClosed` if it
    /// already has.
    pub fn add_close_callback<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = lock(&self.inner.close_callbacks);
        if self.inner.torn_down.load(Ordering::Acquire) {
            return Err(NetpollError::ConnectionClosed);
        }
        callbacks.push(Box::new(f));
        Ok(())
    }

    /// Copy buffered input into `buf` without waiting.
    ///
    /// With nothing buffered: `InsufficientData` while the connection is
    /// open, `ConnectionClosed` once the peer is gone.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.inner.close_requested.load(Ordering::Acquire) {
            return Err(NetpollError::ConnectionClosed);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = lock(&self.inner.input).read_into(buf);
        if n > 0 {
            return Ok(n);
        }
        if self.inner.state.load().is_shutting_down() {
            return Err(NetpollError::ConnectionClosed);
        }
        Err(NetpollError::InsufficientData {
            need: 1,
            available: 0,
        })
    }

    /// Like [`read`](Self::read), but wait up to `timeout` for data.
    pub fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = self.reader()?.wait(1, timeout)?;
        Ok(reader.read_into(buf))
    }

    /// Locked view of the input buffer.
    ///
    /// The poller's reads for this connection block while the reader is
    /// held. Do not call `close` with a reader alive on the same thread.
    pub fn reader(&self) -> Result<Reader<'_>> {
        if self.inner.close_requested.load(Ordering::Acquire) {
            return Err(NetpollError::ConnectionClosed);
        }
        Ok(Reader {
            conn: &self.inner,
            buf: Some(lock(&self.inner.input)),
        })
    }

    /// Locked view of the output buffer. Requires an Active connection.
    ///
    /// Do not call `close` with a writer alive on the same thread.
    pub fn writer(&self) -> Result<Writer<'_>> {
        if !self.inner.state.load().is_active() {
            return Err(NetpollError::ConnectionClosed);
        }
        Ok(Writer {
            conn: &self.inner,
            buf: lock(&self.inner.output),
        })
    }

    /// Append `data` and flush it.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut w = self.writer()?;
        w.write_all(data);
        w.flush()?;
        Ok(data.len())
    }

    /// Close the connection. The second and later calls do nothing.
    ///
    /// Unread input is discarded; unsent output is dropped.
    pub fn close(&self) -> Result<()> {
        if self.inner.close_requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.state.begin_close();
        self.inner.teardown();
        lock(&self.inner.input).clear();
        Ok(())
    }

    // The processing flag and rx_gen form a store/load handshake with the
    // poller, so all four accesses are SeqCst.
    pub(crate) fn try_begin_processing(&self) -> bool {
        self.inner
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_processing(&self) {
        self.inner.processing.store(false, Ordering::SeqCst);
    }

    pub(crate) fn rx_generation(&self) -> u64 {
        self.inner.rx_gen.load(Ordering::SeqCst)
    }

    /// Record that the connect hook finished. Returns true if the
    /// connection closed in the meantime and its disconnect is now due.
    pub(crate) fn mark_connected(&self) -> bool {
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.disconnect_owed.swap(false, Ordering::SeqCst)
    }

    /// Called once the connection closed. Returns true if the disconnect
    /// can run now, false if it waits for [`mark_connected`](Self::mark_connected).
    pub(crate) fn take_disconnect(&self) -> bool {
        self.inner.disconnect_owed.store(true, Ordering::SeqCst);
        self.inner.connected.load(Ordering::SeqCst)
            && self.inner.disconnect_owed.swap(false, Ordering::SeqCst)
    }
}

/// Wrap an already-open descriptor (e.g. one end of a socket pair) as a
/// connection on the next poller of `group`.
pub fn new_fd_connection(group: &PollerGroup, fd: OwnedFd) -> Result<Connection> {
    let raw = fd.as_raw_fd();
    let (local, remote) = (addr::local_of(raw), addr::peer_of(raw));
    Connection::establish(
        Arc::clone(group.pick()),
        group.block_pool(),
        fd,
        ConnKind::Fd,
        local,
        remote,
        None,
    )
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("fd", &self.raw_fd())
            .field("state", &self.state())
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

impl ConnInner {
    fn handle(&self) -> Option<Connection> {
        self.me.upgrade().map(|inner| Connection { inner })
    }

    fn observer(&self) -> Option<Arc<dyn ConnObserver>> {
        self.observer.as_ref().and_then(Weak::upgrade)
    }

    /// Read until EAGAIN, EOF, an error or the burst cap.
    fn fill_input(&self) -> (usize, ReadEnd) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return (0, ReadEnd::Open);
        }
        let mut input = lock(&self.input);
        let mut total = 0;
        let mut end = ReadEnd::Open;
        let mut rounds = 0;
        while rounds < READ_BURST {
            let res = sys::read(fd, input.reserve(READ_MIN));
            match res {
                Ok(0) => {
                    end = ReadEnd::Eof;
                    break;
                }
                Ok(n) => {
                    input.commit(n);
                    total += n;
                    rounds += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    end = ReadEnd::Failed(e);
                    break;
                }
            }
        }
        input.flush();
        (total, end)
    }

    fn handle_readable(&self) {
        let (total, end) = self.fill_input();
        if total > 0 {
            self.rx_gen.fetch_add(1, Ordering::SeqCst);
            self.input_cv.notify_all();
            trace!(conn = self.id, bytes = total, "input");
            if let (Some(obs), Some(conn)) = (self.observer(), self.handle()) {
                obs.on_readable(&conn);
            }
        }
        match end {
            ReadEnd::Open => {}
            ReadEnd::Eof => self.shutdown_by_peer(None),
            ReadEnd::Failed(e) => self.shutdown_by_peer(Some(e)),
        }
    }

    /// Write as much of `out` as the kernel takes. Ok(true) once empty.
    fn send_pending(&self, out: &mut LinkBuffer) -> io::Result<bool> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        while out.readable_len() > 0 {
            let res = {
                let slices = out.io_slices(sys::MAX_IOVECS);
                sys::write_vectored(fd, &slices, self.is_socket)
            };
            match res {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    let _ = out.skip(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        out.release();
        Ok(true)
    }

    /// Push flushed output, arming write interest if the kernel is full.
    fn send_locked(&self, mut out: MutexGuard<'_, LinkBuffer>) -> Result<()> {
        if self.state.load().is_shutting_down() {
            return Err(NetpollError::ConnectionClosed);
        }
        if out.readable_len() == 0 {
            return Ok(());
        }
        let Some(op) = self.op.get() else {
            return Err(NetpollError::ConnectionClosed);
        };
        // on_writable owns the drain while write interest is armed.
        if op.interest().is_writable() {
            return Ok(());
        }
        let res = self
            .send_pending(&mut out)
            .and_then(|drained| match drained {
                true => Ok(()),
                false => self.poller.modify(op, Interest::BOTH),
            });
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(out);
                warn!(conn = self.id, error = %e, "write failed");
                let ret = sys::clone_error(&e);
                self.shutdown_by_peer(Some(e));
                Err(NetpollError::Io(ret))
            }
        }
    }

    fn drain_output(&self) {
        let mut out = lock(&self.output);
        let res = self.send_pending(&mut out);
        let res = match (res, self.op.get()) {
            (Ok(true), Some(op)) => self.poller.modify(op, Interest::READ),
            (Ok(_), _) => Ok(()),
            (Err(e), _) => Err(e),
        };
        if let Err(e) = res {
            drop(out);
            self.shutdown_by_peer(Some(e));
        }
    }

    /// Poller-observed close: EOF, hangup or a failed syscall.
    fn shutdown_by_peer(&self, err: Option<io::Error>) {
        if self.state.begin_close().is_some() {
            match &err {
                Some(e) => debug!(conn = self.id, error = %e, "connection error"),
                None => debug!(conn = self.id, "peer closed"),
            }
            if let Some(e) = err {
                *lock(&self.error) = Some(e);
            }
        }
        self.teardown();
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(op) = self.op.get() {
            if let Err(e) = self.poller.deregister(op) {
                debug!(conn = self.id, error = %e, "deregister failed");
            }
        }
        {
            let mut out = lock(&self.output);
            let fd = self.fd.swap(-1, Ordering::AcqRel);
            if fd >= 0 {
                sys::close(fd);
            }
            out.clear();
        }
        self.state.transition(ConnState::Closing, ConnState::Closed);
        lock(&self.input).release();
        self.input_cv.notify_all();
        debug!(conn = self.id, "connection closed");

        if let (Some(obs), Some(conn)) = (self.observer(), self.handle()) {
            obs.on_closed(&conn);
        }
        let callbacks = std::mem::take(&mut *lock(&self.close_callbacks));
        for cb in callbacks {
            cb();
        }
    }
}

impl FdHandler for ConnInner {
    fn on_readable(&self) {
        self.handle_readable();
    }

    fn on_writable(&self) {
        self.drain_output();
    }

    fn on_hangup(&self) {
        if !self.state.load().is_shutting_down() {
            self.handle_readable();
        }
        let err = match self.fd.load(Ordering::Acquire) {
            fd if fd >= 0 => sys::take_socket_error(fd).ok().flatten(),
            _ => None,
        };
        self.shutdown_by_peer(err);
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::Acquire) {
            self.state.begin_close();
            self.teardown();
        }
    }
}

/// Locked input buffer. Dropping it unlocks.
pub struct Reader<'a> {
    conn: &'a ConnInner,
    buf: Option<MutexGuard<'a, LinkBuffer>>,
}

impl<'a> Reader<'a> {
    fn buf(&self) -> &LinkBuffer {
        match &self.buf {
            Some(g) => &**g,
            None => unreachable!("reader guard taken"),
        }
    }

    fn buf_mut(&mut self) -> &mut LinkBuffer {
        match &mut self.buf {
            Some(g) => &mut **g,
            None => unreachable!("reader guard taken"),
        }
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.buf().readable_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek(&self, n: usize) -> Result<std::borrow::Cow<'_, [u8]>> {
        self.buf().peek(n)
    }

    pub fn next(&mut self, n: usize) -> Result<std::borrow::Cow<'_, [u8]>> {
        self.buf_mut().next(n)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.buf_mut().skip(n)
    }

    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        self.buf_mut().read_into(dst)
    }

    /// Return consumed blocks to the pool.
    pub fn release(&mut self) {
        self.buf_mut().release()
    }

    /// Wait until at least `n` bytes are buffered.
    ///
    /// The lock is released while waiting. Fails with `ReadTimeout` when
    /// `timeout` elapses, or `ConnectionClosed` if the connection shuts
    /// down first.
    pub fn wait(mut self, n: usize, timeout: Duration) -> Result<Reader<'a>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.len() >= n {
                return Ok(self);
            }
            if self.conn.state.load().is_shutting_down()
                || self.conn.close_requested.load(Ordering::Acquire)
            {
                return Err(NetpollError::ConnectionClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NetpollError::ReadTimeout(timeout));
            }
            let Some(guard) = self.buf.take() else {
                return Err(NetpollError::ConnectionClosed);
            };
            let guard = match self.conn.input_cv.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
            self.buf = Some(guard);
        }
    }
}

/// Locked output buffer. Written bytes reach the peer on [`flush`](Self::flush).
pub struct Writer<'a> {
    conn: &'a ConnInner,
    buf: MutexGuard<'a, LinkBuffer>,
}

impl<'a> Writer<'a> {
    pub fn write_all(&mut self, data: &[u8]) {
        self.buf.append(data);
    }

    pub fn write_str(&mut self, s: &str) {
        self.buf.append(s.as_bytes());
    }

    /// `n` contiguous bytes to fill in place, or `None` if `n` exceeds the
    /// block size.
    pub fn malloc(&mut self, n: usize) -> Option<&mut [u8]> {
        self.buf.malloc(n)
    }

    /// Written, unflushed bytes.
    pub fn malloc_len(&self) -> usize {
        self.buf.pending_len()
    }

    /// Publish written bytes and start sending them.
    pub fn flush(self) -> Result<()> {
        let Writer { conn, mut buf } = self;
        buf.flush();
        conn.send_locked(buf)
    }
}
