//! Background worker
//!
//! Each helper owns one worker thread. The helper submits [`Job`]s over a
//! channel and the worker runs them strictly one after another, so at most
//! one blocking socket call is ever in progress per helper. Results travel
//! back as [`Notification`]s on a second channel.

use std::{
    net::TcpStream,
    sync::{Arc, Mutex, MutexGuard, PoisonError, atomic::AtomicBool},
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use sockets::{SocketError, SocketsSubsystem};

use crate::{ErrorKind, HelperConfig, HelperError, Notification, state::Session, transfer};

/// Work submitted from the helper to its worker thread
///
/// Every job carries the cancellation token of the session it belongs to.
#[derive(Debug)]
pub(crate) enum Job {
    /// Wait for a single incoming connection
    Accept {
        port: String,
        cancel: Arc<AtomicBool>,
    },

    /// Connect to a listening server
    Connect {
        host: String,
        port: String,
        cancel: Arc<AtomicBool>,
    },

    /// Write a buffer in chunks
    Send {
        stream: Arc<TcpStream>,
        data: Bytes,
        cancel: Arc<AtomicBool>,
    },

    /// Read until the peer closes the connection
    Receive {
        stream: Arc<TcpStream>,
        cancel: Arc<AtomicBool>,
    },

    /// Stop the worker thread
    Shutdown,
}

pub(crate) fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Worker {
    pub(crate) session: Arc<Mutex<Session>>,
    pub(crate) sockets: Arc<dyn SocketsSubsystem>,
    pub(crate) config: HelperConfig,
    pub(crate) notifications: Sender<Notification>,
}

impl Worker {
    /// The worker thread loop: run jobs until shut down or the helper is gone
    pub(crate) fn run(self, jobs: Receiver<Job>) {
        tracing::debug!("worker started");
        for job in jobs.iter() {
            match job {
                Job::Accept { port, cancel } => {
                    tracing::debug!(%port, "waiting for a connection");
                    let result = self.sockets.listen_and_accept_one(&port, &cancel);
                    self.establish(&cancel, result);
                }
                Job::Connect { host, port, cancel } => {
                    tracing::debug!(%host, %port, "connecting");
                    let result = self.sockets.connect(&host, &port, self.config.timeout(), &cancel);
                    self.establish(&cancel, result);
                }
                Job::Send {
                    stream,
                    data,
                    cancel,
                } => self.send(&stream, &data, &cancel),
                Job::Receive { stream, cancel } => self.receive(&stream, &cancel),
                Job::Shutdown => break,
            }
        }
        tracing::debug!("worker terminated");
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::debug!("helper dropped, discarding notification");
        }
    }

    fn configure(&self, stream: TcpStream) -> Result<TcpStream, HelperError> {
        let timeout = self.config.timeout();
        stream
            .set_read_timeout(timeout)
            .and_then(|()| stream.set_write_timeout(timeout))
            .map_err(|e| {
                HelperError::new(ErrorKind::Socket, format!("configuring connection: {e}"))
            })?;
        Ok(stream)
    }

    /// Notifications about the session are queued while holding its lock, so
    /// they cannot overtake a concurrent disconnect.
    fn establish(&self, cancel: &Arc<AtomicBool>, result: Result<TcpStream, SocketError>) {
        let result = result
            .map_err(|e| HelperError::from_socket(&e))
            .and_then(|stream| self.configure(stream));

        let mut session = lock(&self.session);
        match result {
            Ok(stream) => {
                if session.establish(cancel, stream) {
                    tracing::debug!(state = ?session.state(), "connected");
                    self.notify(Notification::Connected);
                } else {
                    tracing::debug!("session ended while connecting, dropping connection");
                }
            }
            Err(error) if session.abort_start(cancel) => {
                tracing::debug!(%error, "could not establish connection");
                self.notify(Notification::Error(error));
            }
            Err(error) => {
                tracing::debug!(%error, "session ended while connecting");
            }
        }
    }

    fn send(&self, stream: &TcpStream, data: &Bytes, cancel: &Arc<AtomicBool>) {
        tracing::debug!(len = data.len(), "sending data");
        let chunk_size = self.config.chunk_size_nonzero();
        let result = transfer::write_chunked(stream, data, chunk_size, |chunk| {
            tracing::trace!(len = chunk.len(), "sent chunk");
            self.notify(Notification::SentData(chunk));
        });
        self.finish_io(
            cancel,
            result.map(|()| Notification::FinishedSendingData),
            "sending data",
        );
    }

    fn receive(&self, stream: &TcpStream, cancel: &Arc<AtomicBool>) {
        tracing::debug!("receiving data");
        let chunk_size = self.config.chunk_size_nonzero();
        let result = transfer::read_until_closed(stream, chunk_size, |chunk| {
            tracing::trace!(len = chunk.len(), "received chunk");
            self.notify(Notification::ReceivedData(chunk));
        });
        let outcome = result.map(|data| {
            if data.is_empty() {
                Notification::Error(ErrorKind::NoData.into())
            } else {
                Notification::FinishedReceivingData(data)
            }
        });
        self.finish_io(cancel, outcome, "receiving data");
    }

    /// Clear the in-flight flag and report how an operation ended
    ///
    /// The flag is cleared before the final notification is queued, so an
    /// observer may start the next operation from its completion handler.
    fn finish_io(
        &self,
        cancel: &Arc<AtomicBool>,
        outcome: std::io::Result<Notification>,
        context: &str,
    ) {
        let mut session = lock(&self.session);
        if !session.end_io(cancel) {
            // disconnect() shut the stream down underneath us, whatever the
            // outcome looks like
            tracing::debug!(%context, "operation aborted by disconnect");
            self.notify(Notification::Error(HelperError::new(
                ErrorKind::Disconnected,
                format!("{context}: aborted by disconnect"),
            )));
            return;
        }

        match outcome {
            Ok(notification) => {
                tracing::debug!(%context, "operation finished");
                self.notify(notification);
            }
            Err(e) => {
                let error = HelperError::from_io(&e, context);
                let peer_gone = error.is_peer_gone() && session.close();
                tracing::debug!(%error, kind = %error.kind(), peer_gone, "operation failed");
                self.notify(Notification::Error(error));
                if peer_gone {
                    self.notify(Notification::Disconnected);
                }
            }
        }
    }
}
