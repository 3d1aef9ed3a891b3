//! Notifications emitted by a helper and the observers receiving them
//!
//! The background worker never runs observer code. It queues
//! [`Notification`] values on a channel, and the helper's dispatch methods
//! ([`Helper::dispatch`], [`Helper::dispatch_timeout`], [`Helper::wait_for`])
//! deliver them to the registered [`Observer`] on the calling thread. Since a
//! [`Helper`] cannot leave the thread that created it, that is always the same
//! thread, so observers need no synchronisation of their own.
//!
//! For one operation, progress notifications are queued in the order the
//! bytes moved, and the completion or error notification is queued after all
//! of them.
use bytes::Bytes;

use crate::{Helper, HelperError};

/// Something that happened to a helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The helper started, and is connecting or waiting for a connection
    StartedRunning,
    Connected,
    Disconnected,
    /// One chunk arrived during a receive
    ReceivedData(Bytes),
    /// One chunk was written during a send
    SentData(Bytes),
    FinishedSendingData,
    /// The peer closed the connection; carries everything received
    FinishedReceivingData(Bytes),
    Error(HelperError),
}

impl Notification {
    /// Invoke the matching observer method
    pub fn deliver(self, observer: &mut dyn Observer, helper: &Helper) {
        match self {
            Notification::StartedRunning => observer.started_running(helper),
            Notification::Connected => observer.connected(helper),
            Notification::Disconnected => observer.disconnected(helper),
            Notification::ReceivedData(chunk) => observer.received_data(helper, chunk),
            Notification::SentData(chunk) => observer.sent_data(helper, chunk),
            Notification::FinishedSendingData => observer.finished_sending_data(helper),
            Notification::FinishedReceivingData(data) => {
                observer.finished_receiving_data(helper, data)
            }
            Notification::Error(error) => observer.error_occurred(helper, error),
        }
    }
}

/// Receiver of helper notifications
///
/// Every method has an empty default, so implementors only handle what they
/// care about. The helper is passed in so that handlers can issue follow-up
/// commands, e.g. sending a greeting from [`connected`](Observer::connected).
#[allow(unused_variables)]
pub trait Observer {
    fn started_running(&mut self, helper: &Helper) {}

    fn connected(&mut self, helper: &Helper) {}

    fn disconnected(&mut self, helper: &Helper) {}

    fn received_data(&mut self, helper: &Helper, chunk: Bytes) {}

    fn sent_data(&mut self, helper: &Helper, chunk: Bytes) {}

    fn finished_sending_data(&mut self, helper: &Helper) {}

    fn finished_receiving_data(&mut self, helper: &Helper, data: Bytes) {}

    fn error_occurred(&mut self, helper: &Helper, error: HelperError) {}
}

type Handler = Box<dyn FnMut(&Helper)>;
type DataHandler = Box<dyn FnMut(&Helper, Bytes)>;
type ErrorHandler = Box<dyn FnMut(&Helper, HelperError)>;

/// An [`Observer`] built from independently settable closures
///
/// ```
/// use tcphelper::{Handlers, Helper};
///
/// let helper = Helper::new("localhost", "5678");
/// helper.set_observer(
///     Handlers::default()
///         .on_received_data(|_, chunk| println!("got {} bytes", chunk.len()))
///         .on_disconnected(|_| println!("bye")),
/// );
/// ```
#[derive(Default)]
pub struct Handlers {
    started_running: Option<Handler>,
    connected: Option<Handler>,
    disconnected: Option<Handler>,
    received_data: Option<DataHandler>,
    sent_data: Option<DataHandler>,
    finished_sending_data: Option<Handler>,
    finished_receiving_data: Option<DataHandler>,
    error_occurred: Option<ErrorHandler>,
}

impl Handlers {
    pub fn on_started_running(mut self, f: impl FnMut(&Helper) + 'static) -> Self {
        self.started_running = Some(Box::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl FnMut(&Helper) + 'static) -> Self {
        self.connected = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl FnMut(&Helper) + 'static) -> Self {
        self.disconnected = Some(Box::new(f));
        self
    }

    pub fn on_received_data(mut self, f: impl FnMut(&Helper, Bytes) + 'static) -> Self {
        self.received_data = Some(Box::new(f));
        self
    }

    pub fn on_sent_data(mut self, f: impl FnMut(&Helper, Bytes) + 'static) -> Self {
        self.sent_data = Some(Box::new(f));
        self
    }

    pub fn on_finished_sending_data(mut self, f: impl FnMut(&Helper) + 'static) -> Self {
        self.finished_sending_data = Some(Box::new(f));
        self
    }

    pub fn on_finished_receiving_data(mut self, f: impl FnMut(&Helper, Bytes) + 'static) -> Self {
        self.finished_receiving_data = Some(Box::new(f));
        self
    }

    pub fn on_error_occurred(mut self, f: impl FnMut(&Helper, HelperError) + 'static) -> Self {
        self.error_occurred = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("started_running", &self.started_running.is_some())
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("received_data", &self.received_data.is_some())
            .field("sent_data", &self.sent_data.is_some())
            .field("finished_sending_data", &self.finished_sending_data.is_some())
            .field(
                "finished_receiving_data",
                &self.finished_receiving_data.is_some(),
            )
            .field("error_occurred", &self.error_occurred.is_some())
            .finish()
    }
}

impl Observer for Handlers {
    fn started_running(&mut self, helper: &Helper) {
        if let Some(f) = self.started_running.as_mut() {
            f(helper)
        }
    }

    fn connected(&mut self, helper: &Helper) {
        if let Some(f) = self.connected.as_mut() {
            f(helper)
        }
    }

    fn disconnected(&mut self, helper: &Helper) {
        if let Some(f) = self.disconnected.as_mut() {
            f(helper)
        }
    }

    fn received_data(&mut self, helper: &Helper, chunk: Bytes) {
        if let Some(f) = self.received_data.as_mut() {
            f(helper, chunk)
        }
    }

    fn sent_data(&mut self, helper: &Helper, chunk: Bytes) {
        if let Some(f) = self.sent_data.as_mut() {
            f(helper, chunk)
        }
    }

    fn finished_sending_data(&mut self, helper: &Helper) {
        if let Some(f) = self.finished_sending_data.as_mut() {
            f(helper)
        }
    }

    fn finished_receiving_data(&mut self, helper: &Helper, data: Bytes) {
        if let Some(f) = self.finished_receiving_data.as_mut() {
            f(helper, data)
        }
    }

    fn error_occurred(&mut self, helper: &Helper, error: HelperError) {
        if let Some(f) = self.error_occurred.as_mut() {
            f(helper, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_handlers_route_to_matching_slot() {
        let helper = Helper::new("", "1");
        let seen = Rc::new(RefCell::new(Vec::new()));

        let on_data = Rc::clone(&seen);
        let on_error = Rc::clone(&seen);
        let mut handlers = Handlers::default()
            .on_received_data(move |_, chunk| on_data.borrow_mut().push(format!("data {chunk:?}")))
            .on_error_occurred(move |_, error| {
                on_error.borrow_mut().push(format!("error {}", error.kind()))
            });

        Notification::ReceivedData(Bytes::from_static(b"abc")).deliver(&mut handlers, &helper);
        Notification::Connected.deliver(&mut handlers, &helper);
        Notification::Error(ErrorKind::Busy.into()).deliver(&mut handlers, &helper);

        assert_eq!(*seen.borrow(), vec!["data b\"abc\"", "error busy"]);
    }
}
