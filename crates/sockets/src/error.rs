//! Error types for the sockets subsystem.

use std::io;

/// Errors that can occur while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// The port was not a valid TCP port number.
    #[error("invalid port {0:?}")]
    InvalidPort(String),

    /// Host name resolution failed.
    #[error("could not resolve {host}: {source}")]
    Resolve {
        /// The host that was looked up.
        host: String,
        #[source]
        source: io::Error,
    },

    /// Every resolved address refused or failed the connection.
    #[error("could not connect to {host}:{port}: {source}")]
    Connect {
        /// The host that was connected to.
        host: String,
        /// The port that was connected to.
        port: u16,
        /// The error from the last address tried.
        #[source]
        source: io::Error,
    },

    /// No local address could be bound and listened on.
    #[error("could not listen on port {port}: {source}")]
    Listen {
        /// The port that was bound.
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Accepting the incoming connection failed.
    #[error("could not accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Connecting, or waiting for an incoming connection, was cancelled.
    #[error("establishing the connection was cancelled")]
    Cancelled,
}
