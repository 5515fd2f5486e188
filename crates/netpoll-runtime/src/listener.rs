//! Listener: a bound, listening, non-blocking socket.

use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use netpoll_core::{NetpollError, Result};
use socket2::{Domain, Socket, Type};
use tracing::debug;

use crate::addr::{self, Address, Network};
use crate::config::NetpollConfig;
use crate::sync::lock;

pub struct Listener {
    network: Network,
    socket: Mutex<Option<Socket>>,
    local: Address,
    /// Socket file to unlink on close.
    unlink: Option<PathBuf>,
    closed: AtomicBool,
}

impl Listener {
    /// Bind and listen on `address`. The backlog comes from
    /// `NETPOLL_LISTEN_BACKLOG`.
    pub fn bind(network: Network, address: &str) -> Result<Listener> {
        Self::bind_with_backlog(network, address, NetpollConfig::from_env().listen_backlog)
    }

    pub fn bind_with_backlog(network: Network, address: &str, backlog: i32) -> Result<Listener> {
        let sa = addr::resolve(network, address)?;
        let domain = match network {
            Network::Unix => Domain::UNIX,
            _ => Domain::for_address(sa.as_socket().ok_or_else(|| {
                NetpollError::InvalidAddress(address.to_string())
            })?),
        };
        let socket = Socket::new(domain, Type::STREAM.cloexec(), None)?;
        if network.is_tcp() {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&sa)?;
        socket.listen(backlog)?;
        socket.set_nonblocking(true)?;

        let local = socket
            .local_addr()
            .map(|sa| Address::from_sockaddr(&sa))
            .unwrap_or(Address::Unknown);
        let unlink = local.as_path().map(PathBuf::from);
        debug!(network = %network, local = %local, backlog, "listening");

        Ok(Listener {
            network,
            socket: Mutex::new(Some(socket)),
            local,
            unlink,
            closed: AtomicBool::new(false),
        })
    }

    /// Accept one pending connection.
    ///
    /// `Ok(None)` means nothing is pending right now (or the attempt was
    /// aborted by the peer) and the caller should retry on readiness.
    pub fn accept(&self) -> Result<Option<(OwnedFd, Address)>> {
        let guard = lock(&self.socket);
        let Some(socket) = guard.as_ref() else {
            return Err(NetpollError::ListenerClosed);
        };
        match socket.accept() {
            Ok((conn, peer)) => Ok(Some((OwnedFd::from(conn), Address::from_sockaddr(&peer)))),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) || e.raw_os_error() == Some(libc::ECONNABORTED) =>
            {
                Ok(None)
            }
            Err(e) => Err(NetpollError::Io(e)),
        }
    }

    /// Stop listening. Idempotent; unix path listeners remove their socket
    /// file.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(lock(&self.socket).take());
        if let Some(path) = &self.unlink {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(NetpollError::Io(e));
                }
            }
        }
        debug!(local = %self.local, "listener closed");
        Ok(())
    }

    pub fn local_addr(&self) -> &Address {
        &self.local
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Listening descriptor, `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        lock(&self.socket).as_ref().map(|s| s.as_raw_fd())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("network", &self.network)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}
