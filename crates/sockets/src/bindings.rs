use std::io;
use std::net::TcpListener;

use crate::SocketError;

/// Find a local port that is currently free to listen on.
pub fn get_random_tcp_port() -> Result<u16, SocketError> {
    let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no free port");
    for _ in 0..50 {
        match TcpListener::bind("127.0.0.1:0").and_then(|listener| listener.local_addr()) {
            Ok(addr) => return Ok(addr.port()),
            Err(e) => {
                tracing::warn!(%e, "binding");
                last_error = e;
            }
        }
    }

    Err(SocketError::Listen {
        port: 0,
        source: last_error,
    })
}
