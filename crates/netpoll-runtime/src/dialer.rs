//! Dialer: non-blocking connect completed through a one-shot poller
//! registration.
//!
//! ```text
//!   connect() ── Ok ──────────────────────────────┐
//!       │                                         ▼
//!   EINPROGRESS ─► register(WRITE, oneshot) ─► wait ─► deregister ─► wrap
//!                        │                     │
//!                   on_writable:          deadline: caller claims
//!                   SO_ERROR -> result    the outcome first
//! ```
//!
//! Completion is claimed with one CAS, so a dial ends in exactly one of
//! success, the OS error, or `DialTimeout`, never two.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use netpoll_core::{NetpollError, Result};
use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::addr::{self, Address, Network};
use crate::connection::{ConnKind, Connection};
use crate::group::PollerGroup;
use crate::poller::{FdHandler, FdOperator, Interest, Poller};
use crate::sync::lock;
use crate::sys;

/// Factory for outbound connections on a poller group.
#[derive(Debug, Clone)]
pub struct Dialer {
    group: Arc<PollerGroup>,
    timeout: Duration,
}

impl Dialer {
    /// Dialer using the group's configured default timeout.
    pub fn new(group: Arc<PollerGroup>) -> Self {
        let timeout = group.config().dial_timeout;
        Self { group, timeout }
    }

    /// Replace the default timeout. Zero means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn group(&self) -> &Arc<PollerGroup> {
        &self.group
    }

    pub fn dial(&self, network: Network, address: &str) -> Result<Connection> {
        self.dial_timeout(network, address, self.timeout)
    }

    /// Connect to `address`, giving up after `timeout` (zero waits forever).
    pub fn dial_timeout(
        &self,
        network: Network,
        address: &str,
        timeout: Duration,
    ) -> Result<Connection> {
        let sa = addr::resolve(network, address)?;
        let connect_err = |source: io::Error| NetpollError::Connect {
            addr: address.to_string(),
            source,
        };
        let domain = match sa.as_socket() {
            Some(inet) => Domain::for_address(inet),
            None => Domain::UNIX,
        };
        let socket = Socket::new(domain, Type::STREAM.cloexec(), None)?;
        socket.set_nonblocking(true)?;
        if network.is_tcp() {
            socket.set_nodelay(true)?;
        }

        let poller = Arc::clone(self.group.pick());
        match socket.connect(&sa) {
            Ok(()) => {
                debug!(network = %network, address, "dial completed synchronously");
                return self.wrap(poller, network, socket);
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(connect_err(e)),
        }

        let state = Arc::new(DialState::new(socket.as_raw_fd()));
        let weak: Weak<DialState> = Arc::downgrade(&state);
        let handler: Weak<dyn FdHandler> = weak;
        let op = Arc::new(FdOperator::new(socket.as_raw_fd(), Interest::WRITE, handler).oneshot());
        poller.register(&op)?;

        let outcome = state.wait(timeout);
        poller.deregister(&op)?;

        match outcome {
            DialOutcome::Connected => {
                debug!(network = %network, address, "dial completed");
                self.wrap(poller, network, socket)
            }
            DialOutcome::Failed(e) => {
                debug!(network = %network, address, error = %e, "dial failed");
                Err(connect_err(e))
            }
            DialOutcome::TimedOut => {
                debug!(network = %network, address, ?timeout, "dial timed out");
                Err(NetpollError::DialTimeout(timeout))
            }
        }
    }

    fn wrap(&self, poller: Arc<Poller>, network: Network, socket: Socket) -> Result<Connection> {
        let local = socket
            .local_addr()
            .map(|sa| Address::from_sockaddr(&sa))
            .unwrap_or(Address::Unknown);
        let remote = socket
            .peer_addr()
            .map(|sa| Address::from_sockaddr(&sa))
            .unwrap_or(Address::Unknown);
        let kind = if network.is_tcp() {
            ConnKind::Tcp
        } else {
            ConnKind::Unix
        };
        Connection::establish(
            poller,
            self.group.block_pool(),
            OwnedFd::from(socket),
            kind,
            local,
            remote,
            None,
        )
    }
}

enum DialOutcome {
    Connected,
    Failed(io::Error),
    TimedOut,
}

/// Completion slot shared by the dialing thread and the poller callback.
struct DialState {
    fd: RawFd,
    done: AtomicBool,
    result: Mutex<Option<io::Result<()>>>,
    cv: Condvar,
}

impl DialState {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn complete(&self) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let res = match sys::take_socket_error(self.fd) {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) => Err(e),
        };
        *lock(&self.result) = Some(res);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> DialOutcome {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut slot = lock(&self.result);
        loop {
            if let Some(res) = slot.take() {
                return match res {
                    Ok(()) => DialOutcome::Connected,
                    Err(e) => DialOutcome::Failed(e),
                };
            }
            let wait_for = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        if self
                            .done
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            return DialOutcome::TimedOut;
                        }
                        // The callback claimed it and is about to store.
                        None
                    } else {
                        Some(d - now)
                    }
                }
                None => None,
            };
            slot = match wait_for {
                Some(dur) => match self.cv.wait_timeout(slot, dur) {
                    Ok((g, _)) => g,
                    Err(e) => e.into_inner().0,
                },
                None => match self.cv.wait(slot) {
                    Ok(g) => g,
                    Err(e) => e.into_inner(),
                },
            };
        }
    }
}

impl FdHandler for DialState {
    fn on_writable(&self) {
        self.complete();
    }

    fn on_hangup(&self) {
        self.complete();
    }
}
