//! EventLoop: a poller group, an accept handler and the hook task pool.
//!
//! ```text
//!   listener fd ──► Acceptor (poller callback) ──► Connection::establish
//!                                                     │ round-robin poller
//!                                                     ▼
//!   input flushed ──► on_readable ──► processing? ──► TaskPool
//!                                     (one task per        │
//!                                      connection)         ▼
//!                                              on_connect / on_request
//! ```
//!
//! Hooks never run on a poller thread. A connection has at most one hook
//! task queued or running; input that arrives while it runs bumps the
//! connection's read generation, and the task loops again instead of a
//! second task being queued.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use netpoll_core::{NetpollError, Result};
use tracing::{debug, warn};

use crate::addr::{self, Address};
use crate::config::NetpollConfig;
use crate::connection::{ConnKind, ConnObserver, Connection};
use crate::dialer::Dialer;
use crate::group::{io_invalid, PollerGroup};
use crate::listener::Listener;
use crate::poller::{FdHandler, FdOperator, Interest, Poller};
use crate::sync::lock;
use crate::task::TaskPool;

/// Error type returned by hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type HookResult = std::result::Result<(), HookError>;

/// Called whenever a connection has buffered input. An error closes the
/// connection.
pub type OnRequest = Arc<dyn Fn(&Connection) -> HookResult + Send + Sync>;
/// Called once per accepted connection, before any `OnRequest`.
pub type OnConnect = Arc<dyn Fn(&Connection) -> HookResult + Send + Sync>;
/// Called once after a connection closes.
pub type OnDisconnect = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Optional event loop settings.
#[derive(Clone, Default)]
pub struct EventLoopOptions {
    config: Option<NetpollConfig>,
    on_connect: Option<OnConnect>,
    on_disconnect: Option<OnDisconnect>,
}

impl EventLoopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of `NetpollConfig::from_env()`.
    pub fn config(mut self, config: NetpollConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) -> HookResult + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for EventLoopOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopOptions")
            .field("config", &self.config)
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .finish()
    }
}

struct Hooks {
    on_request: OnRequest,
    on_connect: Option<OnConnect>,
    on_disconnect: Option<OnDisconnect>,
}

pub struct EventLoop {
    state: Arc<ServerState>,
}

impl EventLoop {
    pub fn new<F>(on_request: F) -> Result<EventLoop>
    where
        F: Fn(&Connection) -> HookResult + Send + Sync + 'static,
    {
        Self::with_options(on_request, EventLoopOptions::default())
    }

    pub fn with_options<F>(on_request: F, options: EventLoopOptions) -> Result<EventLoop>
    where
        F: Fn(&Connection) -> HookResult + Send + Sync + 'static,
    {
        let config = options.config.unwrap_or_else(NetpollConfig::from_env);
        let tasks = TaskPool::new(config.hook_workers, config.hook_park)?;
        let group = PollerGroup::new(config)?;
        let hooks = Hooks {
            on_request: Arc::new(on_request),
            on_connect: options.on_connect,
            on_disconnect: options.on_disconnect,
        };
        let state = Arc::new_cyclic(|me| ServerState {
            group,
            tasks,
            hooks,
            connections: Mutex::new(HashMap::new()),
            server: Mutex::new(None),
            serve_result: Mutex::new(None),
            serve_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            me: me.clone(),
        });
        Ok(EventLoop { state })
    }

    /// Accept connections from `listener` until shutdown.
    ///
    /// Blocks the calling thread. Returns `Ok(())` after
    /// [`shutdown`](Self::shutdown), or the error that stopped the accept
    /// loop.
    pub fn serve(&self, listener: Listener) -> Result<()> {
        self.state.start_serving(listener)?;
        let mut result = lock(&self.state.serve_result);
        loop {
            if let Some(res) = result.take() {
                return res;
            }
            result = match self.state.serve_cv.wait(result) {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
        }
    }

    /// Stop accepting, close every tracked connection and stop the pollers
    /// and hook workers.
    ///
    /// Returns `ShutdownTimeout` if threads were still running at the
    /// deadline; connections are closed regardless.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.state.shutdown(timeout)
    }

    /// Connections accepted and not yet closed.
    pub fn connection_count(&self) -> usize {
        lock(&self.state.connections).len()
    }

    pub fn poller_group(&self) -> &Arc<PollerGroup> {
        &self.state.group
    }

    /// Dialer sharing this loop's pollers.
    pub fn dialer(&self) -> Dialer {
        Dialer::new(Arc::clone(&self.state.group))
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.state.shutdown(Duration::from_secs(1));
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("group", &self.state.group)
            .field("connections", &self.connection_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

struct ServerSlot {
    acceptor: Arc<Acceptor>,
    op: Arc<FdOperator>,
    poller: Arc<Poller>,
}

struct ServerState {
    group: Arc<PollerGroup>,
    tasks: TaskPool,
    hooks: Hooks,
    connections: Mutex<HashMap<u64, Connection>>,
    server: Mutex<Option<ServerSlot>>,
    serve_result: Mutex<Option<Result<()>>>,
    serve_cv: Condvar,
    shutdown: AtomicBool,
    me: Weak<ServerState>,
}

impl ServerState {
    fn start_serving(&self, listener: Listener) -> Result<()> {
        let mut slot = lock(&self.server);
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(NetpollError::EventLoopShutdown);
        }
        if slot.is_some() {
            return Err(io_invalid("event loop is already serving"));
        }
        let fd = listener.raw_fd().ok_or(NetpollError::ListenerClosed)?;
        let kind = if listener.network().is_tcp() {
            ConnKind::Tcp
        } else {
            ConnKind::Unix
        };
        let acceptor = Arc::new(Acceptor {
            listener,
            kind,
            state: self.me.clone(),
            backoff: AcceptBackoff::default(),
        });
        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        let handler: Weak<dyn FdHandler> = weak;
        let op = Arc::new(FdOperator::new(fd, Interest::READ, handler));
        let poller = Arc::clone(self.group.pick());
        poller.register(&op)?;
        debug!(
            local = %acceptor.listener.local_addr(),
            poller = poller.index(),
            "serving"
        );
        *slot = Some(ServerSlot {
            acceptor,
            op,
            poller,
        });
        Ok(())
    }

    /// Unregister the accept handler and close the listener.
    fn stop_accepting(&self) {
        let Some(slot) = lock(&self.server).take() else {
            return;
        };
        if let Err(e) = slot.poller.deregister(&slot.op) {
            debug!(error = %e, "listener deregister failed");
        }
        if let Err(e) = slot.acceptor.listener.close() {
            warn!(error = %e, "listener close failed");
        }
    }

    fn finish_serve(&self, res: Result<()>) {
        let mut slot = lock(&self.serve_result);
        if slot.is_none() {
            *slot = Some(res);
        }
        self.serve_cv.notify_all();
    }

    fn on_accept(&self, fd: OwnedFd, peer: Address, kind: ConnKind) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let local = addr::local_of(fd.as_raw_fd());
        let observer: Weak<dyn ConnObserver> = self.me.clone();
        let conn = match Connection::establish(
            Arc::clone(self.group.pick()),
            self.group.block_pool(),
            fd,
            kind,
            local,
            peer,
            Some(observer),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "accepted connection not registered");
                return;
            }
        };

        lock(&self.connections).insert(conn.id(), conn.clone());
        if self.shutdown.load(Ordering::SeqCst) {
            lock(&self.connections).remove(&conn.id());
            let _ = conn.close();
            return;
        }
        // Peer closed before it was tracked. Its input is still buffered
        // and goes to the hooks below.
        if !conn.is_active() {
            lock(&self.connections).remove(&conn.id());
        }

        let Some(state) = self.me.upgrade() else {
            return;
        };
        let task_conn = conn.clone();
        if !self.tasks.submit(Box::new(move || state.run_connect(task_conn))) {
            let _ = conn.close();
        }
    }

    fn run_connect(&self, conn: Connection) {
        if let Some(on_connect) = &self.hooks.on_connect {
            if let Err(e) = on_connect(&conn) {
                warn!(conn = conn.id(), error = %e, "connect hook failed");
                let _ = conn.close();
                conn.end_processing();
                if conn.mark_connected() {
                    self.run_disconnect(&conn);
                }
                return;
            }
        }
        self.process(conn.clone());
        if conn.mark_connected() {
            self.run_disconnect(&conn);
        }
    }

    fn run_disconnect(&self, conn: &Connection) {
        if let Some(on_disconnect) = &self.hooks.on_disconnect {
            on_disconnect(conn);
        }
    }

    /// Run the request hook while input is buffered. Called with the
    /// connection's processing flag held; releases it on return.
    fn process(&self, conn: Connection) {
        loop {
            let seen = conn.rx_generation();
            while conn.input_len() > 0 {
                let before = conn.input_len();
                if let Err(e) = (self.hooks.on_request)(&conn) {
                    warn!(conn = conn.id(), error = %e, "request hook failed");
                    let _ = conn.close();
                    break;
                }
                // Hook is waiting for more bytes.
                if conn.input_len() >= before {
                    break;
                }
            }
            conn.end_processing();
            if conn.rx_generation() == seen || !conn.try_begin_processing() {
                return;
            }
        }
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        self.stop_accepting();

        let conns: Vec<Connection> = lock(&self.connections).drain().map(|(_, c)| c).collect();
        debug!(connections = conns.len(), "closing tracked connections");
        for conn in &conns {
            let _ = conn.close();
        }

        let tasks_done = self.tasks.shutdown(deadline);
        let group_res = self
            .group
            .shutdown(deadline.saturating_duration_since(Instant::now()));
        self.finish_serve(Ok(()));

        if !tasks_done || group_res.is_err() {
            warn!(?timeout, "event loop shutdown deadline exceeded");
            return Err(NetpollError::ShutdownTimeout);
        }
        debug!("event loop stopped");
        Ok(())
    }
}

impl ConnObserver for ServerState {
    fn on_readable(&self, conn: &Connection) {
        if !conn.try_begin_processing() {
            return;
        }
        let Some(state) = self.me.upgrade() else {
            conn.end_processing();
            return;
        };
        let task_conn = conn.clone();
        if !self.tasks.submit(Box::new(move || state.process(task_conn))) {
            conn.end_processing();
        }
    }

    fn on_closed(&self, conn: &Connection) {
        lock(&self.connections).remove(&conn.id());
        // Otherwise run_connect calls it once the connect hook is done.
        if !conn.take_disconnect() {
            return;
        }
        if let Some(on_disconnect) = &self.hooks.on_disconnect {
            let f = Arc::clone(on_disconnect);
            let task_conn = conn.clone();
            if !self.tasks.submit(Box::new(move || f(&task_conn))) {
                debug!(conn = conn.id(), "disconnect hook skipped after shutdown");
            }
        }
    }
}

/// Pause after the process or system runs out of descriptors or memory.
/// The listener stays readable meanwhile, so the next wait fires at once.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

/// Tracks a run of resource-exhausted accepts so it is logged once.
#[derive(Default)]
struct AcceptBackoff {
    starved: AtomicBool,
}

impl AcceptBackoff {
    /// Returns true on the first failure of a run.
    fn exhausted(&self) -> bool {
        !self.starved.swap(true, Ordering::Relaxed)
    }

    fn recovered(&self) {
        self.starved.store(false, Ordering::Relaxed);
    }
}

/// Accept handler registered for the listening descriptor.
struct Acceptor {
    listener: Listener,
    kind: ConnKind,
    state: Weak<ServerState>,
    backoff: AcceptBackoff,
}

impl FdHandler for Acceptor {
    fn on_readable(&self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        loop {
            match self.listener.accept() {
                Ok(Some((fd, peer))) => {
                    self.backoff.recovered();
                    state.on_accept(fd, peer, self.kind);
                }
                Ok(None) | Err(NetpollError::ListenerClosed) => break,
                Err(NetpollError::Io(e))
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
                    ) =>
                {
                    if self.backoff.exhausted() {
                        warn!(error = %e, "accept failed, backing off");
                    } else {
                        debug!(error = %e, "accept still failing");
                    }
                    std::thread::sleep(ACCEPT_BACKOFF);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "accept loop stopped");
                    state.stop_accepting();
                    state.finish_serve(Err(e));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Network;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn options() -> EventLoopOptions {
        EventLoopOptions::new().config(
            NetpollConfig::new()
                .num_pollers(2)
                .hook_workers(2)
                .poll_timeout(Duration::from_millis(10)),
        )
    }

    fn echo(conn: &Connection) -> HookResult {
        let n = conn.input_len();
        let data = conn.reader()?.next(n)?.into_owned();
        conn.write(&data)?;
        Ok(())
    }

    fn start(el: EventLoop) -> (Arc<EventLoop>, String, thread::JoinHandle<Result<()>>) {
        let el = Arc::new(el);
        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();
        let server = Arc::clone(&el);
        let handle = thread::spawn(move || server.serve(listener));
        (el, addr, handle)
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
    fn test_echo_round_trip() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        let el = EventLoop::with_options(
            move |conn: &Connection| {
                let n = conn.input_len();
                let data = conn.reader()?.next(n)?.into_owned();
                lock(&seen).extend_from_slice(&data);
                conn.write(&data)?;
                Ok(())
            },
            options(),
        )
        .unwrap();
        let (el, addr, handle) = start(el);

        let conn = el
            .dialer()
            .dial_timeout(Network::Tcp, &addr, Duration::from_secs(2))
            .unwrap();
        conn.write(b"hello world").unwrap();
        let mut r = conn
            .reader()
            .unwrap()
            .wait(11, Duration::from_secs(5))
            .unwrap();
        assert_eq!(&r.next(11).unwrap()[..], b"hello world");
        drop(r);
        assert_eq!(&lock(&received)[..], b"hello world");
        assert!(wait_for(|| el.connection_count() == 1));

        conn.close().unwrap();
        assert!(wait_for(|| el.connection_count() == 0));
        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_connect_hook_runs_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (Arc::clone(&order), Arc::clone(&order));
        let el = EventLoop::with_options(
            move |conn: &Connection| {
                lock(&o1).push("request");
                echo(conn)
            },
            options().on_connect(move |_conn: &Connection| {
                lock(&o2).push("connect");
                Ok(())
            }),
        )
        .unwrap();
        let (el, addr, handle) = start(el);

        let conn = el.dialer().dial(Network::Tcp, &addr).unwrap();
        conn.write(b"x").unwrap();
        conn.reader().unwrap().wait(1, Duration::from_secs(5)).unwrap();
        let order = lock(&order).clone();
        assert_eq!(order.first(), Some(&"connect"));
        assert!(order.contains(&"request"));

        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_hook_error_closes_connection() {
        let el = EventLoop::with_options(
            |_conn: &Connection| Err("reject".into()),
            options(),
        )
        .unwrap();
        let (el, addr, handle) = start(el);

        let conn = el.dialer().dial(Network::Tcp, &addr).unwrap();
        conn.write(b"hello").unwrap();
        assert!(wait_for(|| !conn.is_active()));
        assert!(wait_for(|| el.connection_count() == 0));

        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_disconnect_hook_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let el = EventLoop::with_options(
            echo,
            options().on_disconnect(move |_conn: &Connection| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        let (el, addr, handle) = start(el);

        let conn = el.dialer().dial(Network::Tcp, &addr).unwrap();
        assert!(wait_for(|| el.connection_count() == 1));
        conn.close().unwrap();
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));

        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_closes_tracked_connections() {
        let el = EventLoop::with_options(echo, options()).unwrap();
        let (el, addr, handle) = start(el);

        // Client on its own group so it outlives the server's pollers.
        let client_group = PollerGroup::new(
            NetpollConfig::new()
                .num_pollers(1)
                .poll_timeout(Duration::from_millis(10)),
        )
        .unwrap();
        let dialer = Dialer::new(Arc::clone(&client_group));
        let conn = dialer.dial(Network::Tcp, &addr).unwrap();
        assert!(wait_for(|| el.connection_count() == 1));

        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(el.connection_count(), 0);
        assert!(wait_for(|| !conn.is_active()));

        let listener = Listener::bind(Network::Tcp, "127.0.0.1:0").unwrap();
        assert!(matches!(
            el.serve(listener),
            Err(NetpollError::EventLoopShutdown)
        ));
        el.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_half_closed_client_request_delivered() {
        let bytes = Arc::new(AtomicUsize::new(0));
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (b, c, d) = (
            Arc::clone(&bytes),
            Arc::clone(&connects),
            Arc::clone(&disconnects),
        );
        let el = EventLoop::with_options(
            move |conn: &Connection| {
                let n = conn.input_len();
                let data = conn.reader()?.next(n)?.into_owned();
                b.fetch_add(data.len(), Ordering::SeqCst);
                Ok(())
            },
            options()
                .on_connect(move |_conn: &Connection| {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_disconnect(move |_conn: &Connection| {
                    d.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        let (el, addr, handle) = start(el);

        const CLIENTS: usize = 100;
        let mut clients = Vec::new();
        for _ in 0..CLIENTS {
            let mut s = std::net::TcpStream::connect(&addr).unwrap();
            s.write_all(b"hello").unwrap();
            s.shutdown(std::net::Shutdown::Write).unwrap();
            clients.push(s);
        }
        assert!(
            wait_for(|| bytes.load(Ordering::SeqCst) == CLIENTS * 5),
            "request bytes lost: {} of {}",
            bytes.load(Ordering::SeqCst),
            CLIENTS * 5
        );
        assert!(wait_for(|| disconnects.load(Ordering::SeqCst) == CLIENTS));
        assert_eq!(connects.load(Ordering::SeqCst), CLIENTS);
        assert!(wait_for(|| el.connection_count() == 0));

        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(disconnects.load(Ordering::SeqCst), CLIENTS);
    }

    #[test]
    fn test_ping_pong_keeps_scheduling() {
        let el = EventLoop::with_options(echo, options()).unwrap();
        let (el, addr, handle) = start(el);

        let conn = el.dialer().dial(Network::Tcp, &addr).unwrap();
        for i in 0..500u32 {
            let b = [(i % 251) as u8];
            conn.write(&b).unwrap();
            let mut r = conn
                .reader()
                .unwrap()
                .wait(1, Duration::from_secs(5))
                .unwrap_or_else(|e| panic!("round {} stalled: {:?}", i, e));
            assert_eq!(&r.next(1).unwrap()[..], &b[..]);
        }
        conn.close().unwrap();

        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_deadline_still_closes_connections() {
        let entered = Arc::new(AtomicBool::new(false));
        let e = Arc::clone(&entered);
        let el = EventLoop::with_options(
            move |conn: &Connection| {
                let n = conn.input_len();
                conn.reader()?.skip(n)?;
                e.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(500));
                Ok(())
            },
            options(),
        )
        .unwrap();
        let (el, addr, handle) = start(el);

        let client_group = PollerGroup::new(
            NetpollConfig::new()
                .num_pollers(1)
                .poll_timeout(Duration::from_millis(10)),
        )
        .unwrap();
        let conn = Dialer::new(Arc::clone(&client_group))
            .dial(Network::Tcp, &addr)
            .unwrap();
        conn.write(b"x").unwrap();
        assert!(wait_for(|| entered.load(Ordering::SeqCst)));

        assert!(matches!(
            el.shutdown(Duration::from_millis(50)),
            Err(NetpollError::ShutdownTimeout)
        ));
        assert_eq!(el.connection_count(), 0);
        assert!(wait_for(|| !conn.is_active()));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_accept_backoff_logs_once_per_run() {
        let backoff = AcceptBackoff::default();
        assert!(backoff.exhausted());
        assert!(!backoff.exhausted());
        assert!(!backoff.exhausted());
        backoff.recovered();
        assert!(backoff.exhausted());
    }

    #[test]
    fn test_serve_twice_rejected() {
        let el = EventLoop::with_options(echo, options()).unwrap();
        let (el, _addr, handle) = start(el);
        assert!(wait_for(|| lock(&el.state.server).is_some()));
        let second = Listener::bind(Network::Tcp, "127.0.0.1:0").unwrap();
        assert!(matches!(el.serve(second), Err(NetpollError::Io(_))));
        el.shutdown(Duration::from_secs(5)).unwrap();
        handle.join().unwrap().unwrap();
    }
}
