//! End-to-end dial, serve and close scenarios.

use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netpoll::{
    create_listener, dial_connection, new_fd_connection, Connection, EventLoop, EventLoopOptions,
    HookResult, NetpollConfig, NetpollError, PollerGroup,
};

fn config() -> NetpollConfig {
    NetpollConfig::new()
        .num_pollers(2)
        .hook_workers(2)
        .poll_timeout(Duration::from_millis(10))
}

fn group() -> Arc<PollerGroup> {
    PollerGroup::new(config()).unwrap()
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

struct Server {
    el: Arc<EventLoop>,
    addr: String,
    handle: Option<thread::JoinHandle<netpoll::Result<()>>>,
}

impl Server {
    fn start<F>(network: &str, address: &str, hook: F) -> Server
    where
        F: Fn(&Connection) -> HookResult + Send + Sync + 'static,
    {
        let el = Arc::new(
            EventLoop::with_options(hook, EventLoopOptions::new().config(config())).unwrap(),
        );
        let listener = create_listener(network, address).unwrap();
        let addr = listener.local_addr().to_string();
        let serving = Arc::clone(&el);
        let handle = thread::spawn(move || serving.serve(listener));
        Server {
            el,
            addr,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.el.shutdown(Duration::from_secs(5)).unwrap();
        if let Some(h) = self.handle.take() {
            h.join().unwrap().unwrap();
        }
    }
}

fn take_all(conn: &Connection) -> netpoll::Result<Vec<u8>> {
    let n = conn.input_len();
    Ok(conn.reader()?.next(n)?.into_owned())
}

#[test]
fn test_dial_without_listener_refused() {
    let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = free.local_addr().unwrap().to_string();
    drop(free);
    let g = group();
    match dial_connection(&g, "tcp", &addr, Duration::from_secs(1)) {
        Err(NetpollError::Connect { source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::ConnectionRefused)
        }
        other => panic!("expected connection refused, got {:?}", other),
    }
}

#[test]
fn test_tcp_addresses() {
    let server = Server::start("tcp", "127.0.0.1:0", |_c: &Connection| Ok(()));
    let g = group();
    let conn = dial_connection(&g, "tcp", &server.addr, Duration::from_secs(2)).unwrap();
    assert!(conn.local_addr().to_string().starts_with("127.0.0.1:"));
    assert_eq!(conn.remote_addr().to_string(), server.addr);
    conn.close().unwrap();
    server.stop();
}

#[test]
fn test_unix_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netpoll.sock");
    let path = path.to_str().unwrap().to_string();
    let server = Server::start("unix", &path, |_c: &Connection| Ok(()));
    let g = group();
    let conn = dial_connection(&g, "unix", &path, Duration::from_secs(2)).unwrap();
    assert_eq!(conn.local_addr().to_string(), "@");
    assert_eq!(conn.remote_addr().to_string(), path);
    conn.close().unwrap();
    server.stop();
    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn test_dial_write_peer_close_cycles() {
    let server = Server::start("tcp", "127.0.0.1:0", |conn: &Connection| {
        take_all(conn)?;
        conn.close()?;
        Ok(())
    });
    let g = group();
    for _ in 0..100 {
        let conn = dial_connection(&g, "tcp", &server.addr, Duration::from_secs(2)).unwrap();
        conn.write(b"hello world").unwrap();
        assert!(wait_for(|| !conn.is_active()), "peer close not observed");
        conn.close().unwrap();
    }
    assert!(wait_for(|| g.operator_count() == 0));
    server.stop();
}

#[test]
fn test_concurrent_clients_two_servers() {
    let tagged = |tag: &'static [u8]| {
        move |conn: &Connection| -> HookResult {
            let data = take_all(conn)?;
            let mut w = conn.writer()?;
            w.write_all(tag);
            w.write_all(&data);
            w.flush()?;
            Ok(())
        }
    };
    let a = Server::start("tcp", "127.0.0.1:0", tagged(b"A"));
    let b = Server::start("tcp", "127.0.0.1:0", tagged(b"B"));
    let g = group();

    let failures = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for t in 0..20 {
        let g = Arc::clone(&g);
        let (addr, tag) = if t % 2 == 0 {
            (a.addr.clone(), b'A')
        } else {
            (b.addr.clone(), b'B')
        };
        let failures = Arc::clone(&failures);
        workers.push(thread::spawn(move || {
            for i in 0..50 {
                let msg = format!("{}-{}", t, i);
                let conn = dial_connection(&g, "tcp", &addr, Duration::from_secs(5)).unwrap();
                conn.write(msg.as_bytes()).unwrap();
                let want = msg.len() + 1;
                let mut r = conn
                    .reader()
                    .unwrap()
                    .wait(want, Duration::from_secs(5))
                    .unwrap();
                let reply = r.next(want).unwrap().into_owned();
                drop(r);
                if reply[0] != tag || &reply[1..] != msg.as_bytes() {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                conn.close().unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    a.stop();
    b.stop();
}

#[test]
fn test_socketpair_fd_connections() {
    let (x, y) = std::os::unix::net::UnixStream::pair().unwrap();
    let g = group();
    let left = new_fd_connection(&g, OwnedFd::from(x)).unwrap();
    let right = new_fd_connection(&g, OwnedFd::from(y)).unwrap();

    let mut w = left.writer().unwrap();
    w.write_str("hello");
    w.flush().unwrap();

    let mut r = right
        .reader()
        .unwrap()
        .wait(5, Duration::from_secs(5))
        .unwrap();
    assert_eq!(&r.next(5).unwrap()[..], b"hello");
    drop(r);
    left.close().unwrap();
    right.close().unwrap();
}

#[test]
fn test_buffered_data_survives_peer_close() {
    let server = Server::start("tcp", "127.0.0.1:0", |conn: &Connection| {
        take_all(conn)?;
        conn.write(b"bye")?;
        conn.close()?;
        Ok(())
    });
    let g = group();
    let conn = dial_connection(&g, "tcp", &server.addr, Duration::from_secs(2)).unwrap();
    conn.write(b"ping").unwrap();
    assert!(wait_for(|| !conn.is_active()));

    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"bye");
    assert!(matches!(
        conn.read(&mut buf),
        Err(NetpollError::ConnectionClosed)
    ));
    assert!(matches!(conn.write(b"x"), Err(NetpollError::ConnectionClosed)));
    server.stop();
}

#[test]
fn test_echo_server_sees_exact_bytes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let server = Server::start("tcp", "127.0.0.1:0", move |conn: &Connection| {
        let data = take_all(conn)?;
        record.lock().unwrap().extend_from_slice(&data);
        conn.write(&data)?;
        Ok(())
    });
    let g = group();
    let conn = dial_connection(&g, "tcp", &server.addr, Duration::from_secs(2)).unwrap();
    conn.write(b"hello world").unwrap();
    let mut buf = [0u8; 11];
    let mut got = 0;
    while got < buf.len() {
        got += conn.read_timeout(&mut buf[got..], Duration::from_secs(5)).unwrap();
    }
    assert_eq!(&buf, b"hello world");
    assert_eq!(&seen.lock().unwrap()[..], b"hello world");
    conn.close().unwrap();
    server.stop();
}
