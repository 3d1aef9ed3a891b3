use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    net::TcpStream,
    sync::{Arc, Mutex, MutexGuard, atomic::AtomicBool},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sockets::{SocketsSubsystem, TcpSockets};

use crate::{
    ErrorKind, HelperConfig, HelperError, Notification, Observer, State,
    state::{Session, Transition},
    worker::{self, Job, Worker},
};

/// A single TCP connection, as client or server, driven off-thread
///
/// Commands never block: connecting, accepting, sending and receiving are
/// handed to a background worker owned by the helper. Their outcome, and every
/// failure including a rejected command, is reported as a [`Notification`].
///
/// Notifications are queued until the owning thread calls one of the dispatch
/// methods ([`dispatch`](Helper::dispatch),
/// [`dispatch_timeout`](Helper::dispatch_timeout) or
/// [`wait_for`](Helper::wait_for)), which hands them to the registered
/// [`Observer`] in order. A helper stays on the thread that created it.
///
/// Observer callbacks may call back into the helper, including the dispatch
/// methods. Notifications taken by a dispatch from inside a callback cannot
/// reach the observer, which is busy; they are queued and delivered, in
/// order, as soon as the outermost dispatch resumes. A nested
/// [`wait_for`](Helper::wait_for) still sees them and returns its match.
///
/// Only one send or receive can be in flight at a time; issuing another
/// reports [`ErrorKind::Busy`].
pub struct Helper {
    host: String,
    port: String,
    config: HelperConfig,

    session: Arc<Mutex<Session>>,
    jobs: Sender<Job>,
    worker: Option<JoinHandle<()>>,

    // notifications from both the worker and this thread
    notifications_tx: Sender<Notification>,
    notifications: Receiver<Notification>,

    observer: RefCell<Option<Box<dyn Observer>>>,
    // bumped whenever the observer is replaced, so a dispatch in progress
    // does not put back a stale one
    observer_generation: Cell<u64>,
    // set while an observer callback runs
    dispatching: Cell<bool>,
    // taken off the channel during a callback, awaiting delivery
    pending: RefCell<VecDeque<Notification>>,
}

impl Helper {
    /// Create a helper for `host` and `port` with the default configuration
    ///
    /// `host` is only used by [`start_client`](Helper::start_client) and may
    /// be empty for a server.
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self::with_config(host, port, HelperConfig::default())
    }

    pub fn with_config(
        host: impl Into<String>,
        port: impl Into<String>,
        config: HelperConfig,
    ) -> Self {
        Self::with_sockets(host, port, config, TcpSockets)
    }

    /// Create a helper establishing its connection through `sockets`
    pub fn with_sockets(
        host: impl Into<String>,
        port: impl Into<String>,
        config: HelperConfig,
        sockets: impl SocketsSubsystem,
    ) -> Self {
        let session = Arc::new(Mutex::new(Session::default()));
        let (notifications_tx, notifications) = crossbeam_channel::unbounded();
        let (jobs, jobs_rx) = crossbeam_channel::unbounded();

        let worker = Worker {
            session: Arc::clone(&session),
            sockets: Arc::new(sockets),
            config,
            notifications: notifications_tx.clone(),
        };
        let worker = thread::spawn(move || worker.run(jobs_rx));

        Self {
            host: host.into(),
            port: port.into(),
            config,
            session,
            jobs,
            worker: Some(worker),
            notifications_tx,
            notifications,
            observer: RefCell::new(None),
            observer_generation: Cell::new(0),
            dispatching: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.lock().state()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_server(&self) -> bool {
        self.state().is_server()
    }

    pub fn is_client(&self) -> bool {
        self.state().is_client()
    }

    /// Whether a send or receive is currently in flight
    pub fn is_io_in_progress(&self) -> bool {
        self.lock().io_in_progress()
    }

    /// Register the observer receiving notifications, replacing any previous one
    pub fn set_observer(&self, observer: impl Observer + 'static) {
        self.observer_generation
            .set(self.observer_generation.get().wrapping_add(1));
        *self.observer.borrow_mut() = Some(Box::new(observer));
    }

    /// Remove the observer; notifications are then dropped when dispatched
    pub fn clear_observer(&self) {
        self.observer_generation
            .set(self.observer_generation.get().wrapping_add(1));
        *self.observer.borrow_mut() = None;
    }

    /// Listen on the port and accept one connection in the background
    ///
    /// Notifies [`StartedRunning`](Notification::StartedRunning), then
    /// [`Connected`](Notification::Connected) once a client is in, or a
    /// [`Socket`](ErrorKind::Socket) error.
    #[tracing::instrument(skip(self), fields(port = %self.port))]
    pub fn start_server(&self) {
        if self.port.is_empty() {
            return self.reject(HelperError::new(
                ErrorKind::NoHostOrPort,
                "cannot start server without a port",
            ));
        }
        let Some(cancel) = self.begin(Transition::StartServer) else {
            return;
        };
        self.submit(Job::Accept {
            port: self.port.clone(),
            cancel,
        });
    }

    /// Connect to the host and port in the background
    ///
    /// Notifies [`StartedRunning`](Notification::StartedRunning), then
    /// [`Connected`](Notification::Connected) or a
    /// [`Socket`](ErrorKind::Socket) error.
    #[tracing::instrument(skip(self), fields(host = %self.host, port = %self.port))]
    pub fn start_client(&self) {
        if self.host.is_empty() || self.port.is_empty() {
            return self.reject(HelperError::new(
                ErrorKind::NoHostOrPort,
                "cannot connect without a host and a port",
            ));
        }
        let Some(cancel) = self.begin(Transition::StartClient) else {
            return;
        };
        self.submit(Job::Connect {
            host: self.host.clone(),
            port: self.port.clone(),
            cancel,
        });
    }

    /// Close the connection, or stop connecting or waiting for one
    ///
    /// An operation in flight is aborted and reports a
    /// [`Disconnected`](ErrorKind::Disconnected) error after the
    /// [`Disconnected`](Notification::Disconnected) notification. Does
    /// nothing if the helper is already inactive.
    #[tracing::instrument(skip(self))]
    pub fn disconnect(&self) {
        let mut session = self.lock();
        if !session.close() {
            tracing::debug!("already inactive");
            return;
        }
        tracing::debug!("disconnected");
        // queued under the lock, ahead of anything the aborted job reports
        self.notify(Notification::Disconnected);
    }

    /// Send `data` in chunks in the background
    ///
    /// Notifies [`SentData`](Notification::SentData) per chunk, then
    /// [`FinishedSendingData`](Notification::FinishedSendingData).
    #[tracing::instrument(skip(self, data))]
    pub fn send_data(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let Some((stream, cancel)) = self.begin_io("send") else {
            return;
        };
        self.submit(Job::Send {
            stream,
            data,
            cancel,
        });
    }

    /// Receive until the peer closes the connection, in the background
    ///
    /// Notifies [`ReceivedData`](Notification::ReceivedData) per chunk, then
    /// [`FinishedReceivingData`](Notification::FinishedReceivingData) with
    /// everything received, or a [`NoData`](ErrorKind::NoData) error if the
    /// peer closed without sending anything.
    #[tracing::instrument(skip(self))]
    pub fn receive_data(&self) {
        let Some((stream, cancel)) = self.begin_io("receive") else {
            return;
        };
        self.submit(Job::Receive { stream, cancel });
    }

    /// Deliver every queued notification to the observer without blocking
    ///
    /// Returns the number of notifications delivered, or, from inside an
    /// observer callback, the number set aside for delivery afterwards.
    pub fn dispatch(&self) -> usize {
        let mut delivered = 0;
        while let Some(notification) = self.try_next_notification() {
            self.deliver(notification);
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for a notification, then deliver it and every
    /// other queued one
    pub fn dispatch_timeout(&self, timeout: Duration) -> usize {
        match self.next_notification_timeout(timeout) {
            Some(notification) => {
                self.deliver(notification);
                1 + self.dispatch()
            }
            None => 0,
        }
    }

    /// Deliver notifications one by one until one matches `pred`
    ///
    /// The matching notification is delivered too, and a copy returned.
    /// Returns `None` if nothing matched within `timeout`. A timeout of
    /// [`Duration::MAX`] waits forever.
    pub fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> Option<Notification>
    where
        F: FnMut(&Notification) -> bool,
    {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            let notification = self.next_notification_timeout(remaining)?;
            let matched = pred(&notification).then(|| notification.clone());
            self.deliver(notification);
            if matched.is_some() {
                return matched;
            }
        }
    }

    /// Take the next queued notification without delivering it to the observer
    pub fn try_next_notification(&self) -> Option<Notification> {
        if let Some(notification) = self.take_pending() {
            return Some(notification);
        }
        self.notifications.try_recv().ok()
    }

    /// Wait up to `timeout` for the next notification without delivering it
    /// to the observer
    pub fn next_notification_timeout(&self, timeout: Duration) -> Option<Notification> {
        if let Some(notification) = self.take_pending() {
            return Some(notification);
        }
        match self.notifications.recv_timeout(timeout) {
            Ok(notification) => Some(notification),
            Err(RecvTimeoutError::Timeout) => None,
            // unreachable while we hold a sender ourselves
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Notifications set aside during a callback, once no callback runs
    fn take_pending(&self) -> Option<Notification> {
        if self.dispatching.get() {
            // these are ordered before anything still in the channel
            return None;
        }
        self.pending.borrow_mut().pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        worker::lock(&self.session)
    }

    fn notify(&self, notification: Notification) {
        // we own the receiver, so this cannot fail
        let _ = self.notifications_tx.send(notification);
    }

    fn reject(&self, error: HelperError) {
        tracing::warn!(%error, kind = %error.kind(), "command rejected");
        self.notify(Notification::Error(error));
    }

    fn begin(&self, transition: Transition) -> Option<Arc<AtomicBool>> {
        let started = self.lock().start(transition);
        match started {
            Ok(cancel) => {
                tracing::debug!(state = ?self.state(), "started running");
                self.notify(Notification::StartedRunning);
                Some(cancel)
            }
            Err(kind) => {
                self.reject(HelperError::new(
                    kind,
                    format!("cannot start, helper is {:?}", self.state()),
                ));
                None
            }
        }
    }

    fn begin_io(&self, operation: &str) -> Option<(Arc<TcpStream>, Arc<AtomicBool>)> {
        let begun = self.lock().begin_io();
        match begun {
            Ok(io) => Some(io),
            Err(kind) => {
                let reason = match kind {
                    ErrorKind::Busy => "another operation is in progress",
                    _ => "not connected",
                };
                self.reject(HelperError::new(kind, format!("cannot {operation}: {reason}")));
                None
            }
        }
    }

    fn submit(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            tracing::error!("worker thread has stopped");
            self.lock().close();
            self.notify(Notification::Error(HelperError::new(
                ErrorKind::Io,
                "background worker has stopped",
            )));
        }
    }

    fn deliver(&self, notification: Notification) {
        if self.dispatching.get() {
            tracing::trace!(?notification, "deferring until the current callback returns");
            self.pending.borrow_mut().push_back(notification);
            return;
        }

        tracing::trace!(?notification, "dispatching");
        // take the observer out so that it can call back into the helper
        let Some(mut observer) = self.observer.borrow_mut().take() else {
            return;
        };
        let generation = self.observer_generation.get();
        self.dispatching.set(true);
        notification.deliver(observer.as_mut(), self);
        self.dispatching.set(false);
        if self.observer_generation.get() == generation {
            *self.observer.borrow_mut() = Some(observer);
        }
    }
}

impl std::fmt::Debug for Helper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Helper")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("io_in_progress", &self.is_io_in_progress())
            .finish_non_exhaustive()
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        tracing::debug!("shutting down helper");
        self.lock().close();
        // the current job is cancelled or unblocked, queued ones are stale
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}
