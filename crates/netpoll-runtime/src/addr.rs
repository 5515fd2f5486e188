//! Networks and socket addresses.
//!
//! `tcp`, `tcp4` and `tcp6` take `host:port`; `unix` takes a filesystem
//! path, or `@name` for the Linux abstract namespace.

use std::ffi::OsStr;
use std::fmt;
use std::mem::ManuallyDrop;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use netpoll_core::{NetpollError, Result};
use socket2::{Domain, SockAddr, Socket};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
}

impl Network {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
        }
    }

    #[inline]
    pub const fn is_tcp(&self) -> bool {
        !matches!(self, Network::Unix)
    }
}

impl FromStr for Network {
    type Err = NetpollError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            other => Err(NetpollError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unix-domain address forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixAddr {
    /// Filesystem path.
    Path(PathBuf),
    /// Abstract namespace name (without the leading NUL).
    Abstract(Vec<u8>),
    /// Unbound socket, e.g. the client end of a unix dial.
    Unnamed,
}

/// Endpoint address of a connection or listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet(SocketAddr),
    Unix(UnixAddr),
    /// Descriptor is not a socket, or its address could not be read.
    Unknown,
}

impl Address {
    pub fn from_sockaddr(sa: &SockAddr) -> Address {
        if let Some(inet) = sa.as_socket() {
            return Address::Inet(inet);
        }
        if sa.domain() != Domain::UNIX {
            return Address::Unknown;
        }
        if let Some(path) = sa.as_pathname() {
            return Address::Unix(UnixAddr::Path(path.to_path_buf()));
        }
        if let Some(name) = sa.as_abstract_namespace() {
            return Address::Unix(UnixAddr::Abstract(name.to_vec()));
        }
        Address::Unix(UnixAddr::Unnamed)
    }

    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(sa) => Some(*sa),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Address::Unix(UnixAddr::Path(p)) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(sa) => write!(f, "{}", sa),
            Address::Unix(UnixAddr::Path(p)) => write!(f, "{}", p.display()),
            Address::Unix(UnixAddr::Abstract(name)) => {
                write!(f, "@{}", String::from_utf8_lossy(name))
            }
            Address::Unix(UnixAddr::Unnamed) => f.write_str("@"),
            Address::Unknown => Ok(()),
        }
    }
}

/// Resolve `address` for `network` into a socket address.
pub(crate) fn resolve(network: Network, address: &str) -> Result<SockAddr> {
    let invalid = || NetpollError::InvalidAddress(address.to_string());
    match network {
        Network::Unix => {
            if address.is_empty() {
                return Err(invalid());
            }
            if let Some(name) = address.strip_prefix('@') {
                let mut raw = Vec::with_capacity(name.len() + 1);
                raw.push(0u8);
                raw.extend_from_slice(name.as_bytes());
                SockAddr::unix(OsStr::from_bytes(&raw)).map_err(|_| invalid())
            } else {
                SockAddr::unix(address).map_err(|_| invalid())
            }
        }
        _ => {
            let candidates = address.to_socket_addrs().map_err(|_| invalid())?;
            candidates
                .into_iter()
                .find(|sa| match network {
                    Network::Tcp4 => sa.is_ipv4(),
                    Network::Tcp6 => sa.is_ipv6(),
                    _ => true,
                })
                .map(SockAddr::from)
                .ok_or_else(invalid)
        }
    }
}

fn with_borrowed_socket<T>(fd: RawFd, f: impl FnOnce(&Socket) -> T) -> T {
    // SAFETY: ManuallyDrop keeps the borrowed descriptor open.
    let sock = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
    f(&sock)
}

/// Local address of `fd`, `Unknown` if it has none.
pub(crate) fn local_of(fd: RawFd) -> Address {
    with_borrowed_socket(fd, |s| s.local_addr())
        .map(|sa| Address::from_sockaddr(&sa))
        .unwrap_or(Address::Unknown)
}

/// Peer address of `fd`, `Unknown` if it has none.
pub(crate) fn peer_of(fd: RawFd) -> Address {
    with_borrowed_socket(fd, |s| s.peer_addr())
        .map(|sa| Address::from_sockaddr(&sa))
        .unwrap_or(Address::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("unix".parse::<Network>().unwrap(), Network::Unix);
        match "udp".parse::<Network>() {
            Err(NetpollError::UnsupportedNetwork(n)) => assert_eq!(n, "udp"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolve_tcp() {
        let sa = resolve(Network::Tcp, "127.0.0.1:8080").unwrap();
        assert_eq!(
            Address::from_sockaddr(&sa).to_string(),
            "127.0.0.1:8080"
        );
        assert!(resolve(Network::Tcp6, "127.0.0.1:8080").is_err());
        assert!(resolve(Network::Tcp, "no-port").is_err());
    }

    #[test]
    fn test_resolve_unix_forms() {
        let sa = resolve(Network::Unix, "/tmp/netpoll.sock").unwrap();
        assert_eq!(
            Address::from_sockaddr(&sa),
            Address::Unix(UnixAddr::Path(PathBuf::from("/tmp/netpoll.sock")))
        );

        let sa = resolve(Network::Unix, "@netpoll-test").unwrap();
        let addr = Address::from_sockaddr(&sa);
        assert_eq!(addr, Address::Unix(UnixAddr::Abstract(b"netpoll-test".to_vec())));
        assert_eq!(addr.to_string(), "@netpoll-test");

        assert!(resolve(Network::Unix, "").is_err());
    }

    #[test]
    fn test_unnamed_display() {
        assert_eq!(Address::Unix(UnixAddr::Unnamed).to_string(), "@");
        assert_eq!(Address::Unknown.to_string(), "");
    }

    #[test]
    fn test_addresses_of_socketpair() {
        use std::os::unix::io::AsRawFd;
        let (a, _b) = Socket::pair(Domain::UNIX, socket2::Type::STREAM, None).unwrap();
        assert_eq!(local_of(a.as_raw_fd()), Address::Unix(UnixAddr::Unnamed));
        assert_eq!(peer_of(a.as_raw_fd()), Address::Unix(UnixAddr::Unnamed));
    }
}
