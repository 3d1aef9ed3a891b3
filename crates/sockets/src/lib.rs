//! Sockets subsystem
//!
//! This crate contains the blocking socket primitives the connection helper is
//! built on: address resolution, connecting to a server, and listening for a
//! single incoming connection. Everything here blocks the calling thread; the
//! helper only ever calls into it from its background worker.
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

mod bindings;
mod error;
mod tcp;

pub use bindings::get_random_tcp_port;
pub use error::SocketError;
pub use tcp::{LISTEN_BACKLOG, TcpSockets};

/// Blocking provider of connected TCP streams
///
/// Both methods return a ready, bidirectional byte stream or a typed failure.
/// Implementations must be shareable with a background thread.
pub trait SocketsSubsystem: Send + Sync + 'static {
    /// Connect to `host:port`, trying every resolved address in order.
    ///
    /// When `timeout` is set, each connection attempt is bounded by it.
    /// Implementations must check `cancel` while the handshake is pending and
    /// return [`SocketError::Cancelled`] once it is set.
    fn connect(
        &self,
        host: &str,
        port: &str,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<TcpStream, SocketError>;

    /// Listen on `port` on every local interface and accept exactly one
    /// connection. The listening socket is closed before returning.
    ///
    /// Implementations must check `cancel` while waiting and return
    /// [`SocketError::Cancelled`] once it is set.
    fn listen_and_accept_one(
        &self,
        port: &str,
        cancel: &AtomicBool,
    ) -> Result<TcpStream, SocketError>;
}
