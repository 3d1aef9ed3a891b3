//! Asynchronous TCP connection helper
//!
//! This crate wraps a single TCP connection, as either the client or the
//! server side, in a [`Helper`]. Connecting, accepting, sending and receiving
//! run on a background worker thread owned by the helper, while progress,
//! completion and error notifications are handed to a registered
//! [`Observer`] on the thread that owns the helper.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use tcphelper::{Handlers, Helper, Notification};
//!
//! let helper = Helper::new("localhost", "5678");
//! helper.set_observer(
//!     Handlers::default()
//!         .on_connected(|helper| helper.send_data(&b"hello"[..]))
//!         .on_error_occurred(|_, error| eprintln!("{}: {error}", error.kind())),
//! );
//! helper.start_client();
//!
//! // deliver notifications until the data has gone out
//! helper.wait_for(Duration::from_secs(5), |n| {
//!     matches!(n, Notification::FinishedSendingData | Notification::Error(_))
//! });
//! ```
mod config;
mod error;
mod helper;
mod observer;
mod state;
mod transfer;
mod worker;

pub use config::{ConfigError, DEFAULT_CHUNK_SIZE, HelperConfig};
pub use error::{ErrorKind, HelperError};
pub use helper::Helper;
pub use observer::{Handlers, Notification, Observer};
pub use state::State;

// re-export
pub use bytes::Bytes;
pub use sockets::{SocketError, SocketsSubsystem, TcpSockets};
