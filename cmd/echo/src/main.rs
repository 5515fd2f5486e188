//! Echo server on the netpoll event loop.
//!
//! Usage:
//!     cargo build --release -p netpoll-echo
//!     ./target/release/echo [network] [address]
//!
//!     network: tcp (default), tcp4, tcp6 or unix
//!     address: 0.0.0.0:9997 (default), or a socket path / @name for unix
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9997
//!
//! Logging is controlled by RUST_LOG, e.g. RUST_LOG=netpoll_runtime=debug.
//! Pollers and hook workers follow the NETPOLL_* environment variables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netpoll::{create_listener, Connection, EventLoop, EventLoopOptions, HookResult, NetpollConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Stats {
    accepts: AtomicU64,
    bytes: AtomicU64,
    active: AtomicU64,
}

impl Stats {
    fn new() -> Self {
        Self {
            accepts: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            active: AtomicU64::new(0),
        }
    }
}

fn echo(conn: &Connection, stats: &Stats) -> HookResult {
    let n = conn.input_len();
    if n == 0 {
        return Ok(());
    }
    let data = conn.reader()?.next(n)?.into_owned();
    conn.write(&data)?;
    stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let network = args.get(1).map(String::as_str).unwrap_or("tcp");
    let address = args.get(2).map(String::as_str).unwrap_or("0.0.0.0:9997");

    let config = NetpollConfig::from_env();
    info!(
        pollers = config.num_pollers,
        hook_workers = config.hook_workers,
        block_size = config.block_size,
        "starting echo server"
    );

    let stats = Arc::new(Stats::new());
    let (on_req, on_conn, on_disc) = (Arc::clone(&stats), Arc::clone(&stats), Arc::clone(&stats));
    let options = EventLoopOptions::new()
        .config(config)
        .on_connect(move |_conn: &Connection| {
            on_conn.accepts.fetch_add(1, Ordering::Relaxed);
            on_conn.active.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .on_disconnect(move |_conn: &Connection| {
            on_disc.active.fetch_sub(1, Ordering::Relaxed);
        });
    let event_loop = EventLoop::with_options(move |conn: &Connection| echo(conn, &on_req), options)?;

    let listener = create_listener(network, address)?;
    info!(network, local = %listener.local_addr(), "listening");

    // Stats printer
    let printer = Arc::clone(&stats);
    let start = Instant::now();
    thread::Builder::new()
        .name("echo-stats".into())
        .spawn(move || loop {
            thread::sleep(Duration::from_secs(5));
            info!(
                elapsed_s = start.elapsed().as_secs(),
                active = printer.active.load(Ordering::Relaxed),
                accepts = printer.accepts.load(Ordering::Relaxed),
                bytes = printer.bytes.load(Ordering::Relaxed),
                "stats"
            );
        })?;

    event_loop.serve(listener)?;
    Ok(())
}
