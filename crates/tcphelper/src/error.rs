//! Error taxonomy for helper operations.

use std::{fmt, io};

use sockets::SocketError;

/// The kind of failure reported to an observer.
///
/// The set of kinds is closed; each has a stable numeric [`code`](ErrorKind::code)
/// and symbolic [name](ErrorKind::as_str).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Socket creation, resolution, connect, bind or accept failed.
    Socket,
    /// A send or receive is already in flight, or the helper is already started.
    Busy,
    /// There is no live connection, or the peer went away mid-operation.
    Disconnected,
    /// The host or port required to start is missing.
    NoHostOrPort,
    /// The peer closed the connection before sending anything.
    NoData,
    /// A read or write failed for a reason other than disconnection.
    Io,
    /// The configured timeout elapsed without progress.
    TimedOut,
}

impl ErrorKind {
    /// Stable numeric code for this kind.
    pub const fn code(self) -> u8 {
        match self {
            ErrorKind::Socket => 1,
            ErrorKind::Busy => 2,
            ErrorKind::Disconnected => 3,
            ErrorKind::NoHostOrPort => 4,
            ErrorKind::NoData => 5,
            ErrorKind::Io => 6,
            ErrorKind::TimedOut => 7,
        }
    }

    /// Stable symbolic name for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Socket => "socket",
            ErrorKind::Busy => "busy",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::NoHostOrPort => "no_host_or_port",
            ErrorKind::NoData => "no_data",
            ErrorKind::Io => "io",
            ErrorKind::TimedOut => "timed_out",
        }
    }

    const fn default_description(self) -> &'static str {
        match self {
            ErrorKind::Socket => "socket error",
            ErrorKind::Busy => "another operation is in progress",
            ErrorKind::Disconnected => "not connected",
            ErrorKind::NoHostOrPort => "no host or port specified",
            ErrorKind::NoData => "no data received",
            ErrorKind::Io => "input/output error",
            ErrorKind::TimedOut => "operation timed out",
        }
    }

    /// Map a low-level I/O failure onto the taxonomy.
    pub(crate) fn classify(kind: io::ErrorKind) -> Self {
        match kind {
            // read/write timeouts surface as WouldBlock on unix
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::TimedOut,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => ErrorKind::Disconnected,
            _ => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failure, delivered once through
/// [`Observer::error_occurred`](crate::Observer::error_occurred).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{description}")]
pub struct HelperError {
    kind: ErrorKind,
    description: String,
}

impl HelperError {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    pub(crate) fn from_socket(error: &SocketError) -> Self {
        Self::new(ErrorKind::Socket, error.to_string())
    }

    /// Classify an I/O failure that happened while doing `context`
    pub(crate) fn from_io(error: &io::Error, context: &str) -> Self {
        Self::new(ErrorKind::classify(error.kind()), format!("{context}: {error}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this failure means the peer is gone and the session is over
    pub fn is_peer_gone(&self) -> bool {
        self.kind == ErrorKind::Disconnected
    }
}

impl From<ErrorKind> for HelperError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let kinds = [
            ErrorKind::Socket,
            ErrorKind::Busy,
            ErrorKind::Disconnected,
            ErrorKind::NoHostOrPort,
            ErrorKind::NoData,
            ErrorKind::Io,
            ErrorKind::TimedOut,
        ];
        let codes: Vec<u8> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_classify_io_errors() {
        assert_eq!(
            ErrorKind::classify(io::ErrorKind::WouldBlock),
            ErrorKind::TimedOut
        );
        assert_eq!(
            ErrorKind::classify(io::ErrorKind::TimedOut),
            ErrorKind::TimedOut
        );
        assert_eq!(
            ErrorKind::classify(io::ErrorKind::BrokenPipe),
            ErrorKind::Disconnected
        );
        assert_eq!(
            ErrorKind::classify(io::ErrorKind::ConnectionReset),
            ErrorKind::Disconnected
        );
        assert_eq!(
            ErrorKind::classify(io::ErrorKind::WriteZero),
            ErrorKind::Disconnected
        );
        assert_eq!(
            ErrorKind::classify(io::ErrorKind::PermissionDenied),
            ErrorKind::Io
        );
    }

    #[test]
    fn test_description_carries_context() {
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let error = HelperError::from_io(&err, "sending data");
        assert_eq!(error.kind(), ErrorKind::Disconnected);
        assert!(error.is_peer_gone());
        assert_eq!(error.to_string(), "sending data: pipe closed");
    }

    #[test]
    fn test_socket_errors_classify_as_socket() {
        let error = HelperError::from_socket(&SocketError::InvalidPort("x".to_string()));
        assert_eq!(error.kind(), ErrorKind::Socket);
        assert_eq!(error.description(), "invalid port \"x\"");
    }

    #[test]
    fn test_default_description() {
        let error = HelperError::from(ErrorKind::NoHostOrPort);
        assert_eq!(error.kind().as_str(), "no_host_or_port");
        assert_eq!(error.to_string(), "no host or port specified");
    }
}
