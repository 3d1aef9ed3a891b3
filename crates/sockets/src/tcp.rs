//! TCP implementation of the sockets subsystem

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{SocketError, SocketsSubsystem};

/// Number of pending connections the listening socket queues
pub const LISTEN_BACKLOG: i32 = 10;

/// How often a pending accept or connect checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Sockets subsystem backed by the operating system's TCP stack
///
/// # Examples
///
/// ```no_run
/// use std::sync::atomic::AtomicBool;
///
/// use sockets::{SocketsSubsystem, TcpSockets};
///
/// let cancel = AtomicBool::new(false);
/// let stream = TcpSockets.connect("localhost", "5678", None, &cancel)?;
/// # Ok::<(), sockets::SocketError>(())
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSockets;

impl TcpSockets {
    /// Bind and listen on the wildcard address, preferring IPv4 and falling
    /// back to IPv6.
    fn listen(port: u16) -> Result<TcpListener, SocketError> {
        let candidates = [
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
        ];

        let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no local address");
        for addr in candidates {
            match Self::listen_on(addr) {
                Ok(socket) => {
                    tracing::debug!(%addr, "listening");
                    return Ok(socket.into());
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "could not listen");
                    last_error = e;
                }
            }
        }

        Err(SocketError::Listen {
            port,
            source: last_error,
        })
    }

    fn listen_on(addr: SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket)
    }

    fn accept_one(
        listener: &TcpListener,
        cancel: &AtomicBool,
    ) -> Result<TcpStream, SocketError> {
        // non-blocking so the cancellation flag gets polled
        listener.set_nonblocking(true).map_err(SocketError::Accept)?;

        loop {
            if cancel.load(Ordering::SeqCst) {
                tracing::debug!("accept cancelled");
                return Err(SocketError::Cancelled);
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    // some platforms hand out accepted sockets in non-blocking mode
                    stream.set_nonblocking(false).map_err(SocketError::Accept)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SocketError::Accept(e)),
            }
        }
    }

    /// Connect to a single address without blocking on the handshake
    ///
    /// Returns `Ok(None)` once `cancel` is set.
    fn connect_one(
        addr: SocketAddr,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> io::Result<Option<TcpStream>> {
        if cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {
                let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
                loop {
                    if cancel.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    if let Some(e) = socket.take_error()? {
                        return Err(e);
                    }
                    match socket.peer_addr() {
                        Ok(_) => break,
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                        Err(e) => return Err(e),
                    }
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "connection timed out"));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
            Err(e) => return Err(e),
        }

        socket.set_nonblocking(false)?;
        Ok(Some(socket.into()))
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || in_progress_os_error(err)
}

#[cfg(unix)]
fn in_progress_os_error(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS)
}

#[cfg(not(unix))]
fn in_progress_os_error(_err: &io::Error) -> bool {
    false
}

fn parse_port(port: &str) -> Result<u16, SocketError> {
    port.trim()
        .parse()
        .map_err(|_| SocketError::InvalidPort(port.to_string()))
}

impl SocketsSubsystem for TcpSockets {
    #[tracing::instrument(skip(self, cancel))]
    fn connect(
        &self,
        host: &str,
        port: &str,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<TcpStream, SocketError> {
        let port = parse_port(port)?;
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| SocketError::Resolve {
                host: host.to_string(),
                source,
            })?;

        let mut last_error =
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for addr in addrs {
            tracing::debug!(%addr, "trying to make connection");
            match Self::connect_one(addr, timeout, cancel) {
                Ok(Some(stream)) => {
                    tracing::debug!(%addr, "connection made");
                    return Ok(stream);
                }
                Ok(None) => {
                    tracing::debug!(%addr, "connect cancelled");
                    return Err(SocketError::Cancelled);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "error making connection");
                    last_error = e;
                }
            }
        }

        Err(SocketError::Connect {
            host: host.to_string(),
            port,
            source: last_error,
        })
    }

    #[tracing::instrument(skip(self, cancel))]
    fn listen_and_accept_one(
        &self,
        port: &str,
        cancel: &AtomicBool,
    ) -> Result<TcpStream, SocketError> {
        let port = parse_port(port)?;
        let listener = Self::listen(port)?;
        // the listener is dropped, and so closed, once the single connection is in
        Self::accept_one(&listener, cancel)
    }
}
