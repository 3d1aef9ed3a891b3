use std::{
    net::{Shutdown, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::error::ErrorKind;

/// Connection lifecycle of a [`Helper`](crate::Helper)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Inactive,
    ServerRunning,
    ServerConnected,
    ClientRunning,
    ClientConnected,
}

impl State {
    /// Started and not yet disconnected, whether or not a peer is connected
    pub fn is_running(self) -> bool {
        !matches!(self, State::Inactive)
    }

    pub fn is_connected(self) -> bool {
        matches!(self, State::ServerConnected | State::ClientConnected)
    }

    pub fn is_server(self) -> bool {
        matches!(self, State::ServerRunning | State::ServerConnected)
    }

    pub fn is_client(self) -> bool {
        matches!(self, State::ClientRunning | State::ClientConnected)
    }
}

/// Everything that may change the state or the in-flight flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    StartServer,
    StartClient,
    /// The sockets subsystem handed over a connected stream
    Established,
    /// Connecting or accepting failed
    EstablishFailed,
    BeginIo,
    EndIo,
    Disconnect,
}

/// The state together with the in-flight guard
///
/// Both only ever change through [`Machine::apply`], so they cannot be
/// observed out of step with each other.
#[derive(Debug, Default)]
pub(crate) struct Machine {
    state: State,
    io_in_progress: bool,
}

impl Machine {
    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn io_in_progress(&self) -> bool {
        self.io_in_progress
    }

    /// Validate and perform a transition, returning the new state
    ///
    /// An illegal transition leaves the machine untouched and returns the
    /// kind of error the caller should report.
    pub(crate) fn apply(&mut self, transition: Transition) -> Result<State, ErrorKind> {
        use State::*;
        use Transition::*;

        let next = match (transition, self.state) {
            (StartServer, Inactive) => ServerRunning,
            (StartClient, Inactive) => ClientRunning,
            (StartServer | StartClient, _) => return Err(ErrorKind::Busy),

            (Established, ServerRunning) => ServerConnected,
            (Established, ClientRunning) => ClientConnected,
            (Established, _) => return Err(ErrorKind::Disconnected),

            (EstablishFailed, ServerRunning | ClientRunning) => Inactive,
            (EstablishFailed, _) => return Err(ErrorKind::Disconnected),

            (BeginIo, ServerConnected | ClientConnected) if self.io_in_progress => {
                return Err(ErrorKind::Busy);
            }
            (BeginIo, ServerConnected | ClientConnected) => {
                self.io_in_progress = true;
                self.state
            }
            (BeginIo, _) => return Err(ErrorKind::Disconnected),

            (EndIo, state) => {
                self.io_in_progress = false;
                state
            }

            (Disconnect, Inactive) => return Err(ErrorKind::Disconnected),
            (Disconnect, _) => {
                self.io_in_progress = false;
                Inactive
            }
        };

        tracing::trace!(from = ?self.state, to = ?next, ?transition, "state transition");
        self.state = next;
        Ok(next)
    }
}

/// Per-helper state shared between the caller and the background worker
///
/// Guarded by a single mutex. Each start creates a fresh cancellation token;
/// work submitted for a session only touches the session while its token is
/// still the current, uncancelled one.
#[derive(Debug, Default)]
pub(crate) struct Session {
    machine: Machine,
    stream: Option<Arc<TcpStream>>,
    cancel: Arc<AtomicBool>,
}

impl Session {
    pub(crate) fn state(&self) -> State {
        self.machine.state()
    }

    pub(crate) fn io_in_progress(&self) -> bool {
        self.machine.io_in_progress()
    }

    fn is_current(&self, cancel: &Arc<AtomicBool>) -> bool {
        Arc::ptr_eq(&self.cancel, cancel) && !cancel.load(Ordering::SeqCst)
    }

    /// Leave `Inactive`, returning the token for the new session
    pub(crate) fn start(&mut self, transition: Transition) -> Result<Arc<AtomicBool>, ErrorKind> {
        self.machine.apply(transition)?;
        self.cancel = Arc::new(AtomicBool::new(false));
        Ok(Arc::clone(&self.cancel))
    }

    /// Take ownership of a freshly connected stream
    ///
    /// Returns `false`, dropping the stream, if the session was cancelled
    /// while connecting.
    pub(crate) fn establish(&mut self, cancel: &Arc<AtomicBool>, stream: TcpStream) -> bool {
        if !self.is_current(cancel) || self.machine.apply(Transition::Established).is_err() {
            return false;
        }
        self.stream = Some(Arc::new(stream));
        true
    }

    /// Return to `Inactive` after a failed connect or accept
    ///
    /// Returns `false` if the session is no longer current, in which case
    /// the failure has nobody left to report to.
    pub(crate) fn abort_start(&mut self, cancel: &Arc<AtomicBool>) -> bool {
        self.is_current(cancel) && self.machine.apply(Transition::EstablishFailed).is_ok()
    }

    /// Mark a send or receive as in flight, handing out the stream to use
    pub(crate) fn begin_io(&mut self) -> Result<(Arc<TcpStream>, Arc<AtomicBool>), ErrorKind> {
        let stream = self.stream.clone().ok_or(ErrorKind::Disconnected)?;
        self.machine.apply(Transition::BeginIo)?;
        Ok((stream, Arc::clone(&self.cancel)))
    }

    /// Clear the in-flight flag, unless the session has been torn down in
    /// the meantime. Returns whether the session is still current.
    pub(crate) fn end_io(&mut self, cancel: &Arc<AtomicBool>) -> bool {
        if !self.is_current(cancel) {
            return false;
        }
        let _ = self.machine.apply(Transition::EndIo);
        true
    }

    /// Cancel pending work, shut the stream down and return to `Inactive`
    ///
    /// Shutting the stream down unblocks a read or write in progress on the
    /// worker. Returns `false` if there was nothing to disconnect.
    pub(crate) fn close(&mut self) -> bool {
        if self.machine.apply(Transition::Disconnect).is_err() {
            return false;
        }
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                tracing::debug!(error = %e, "shutting down stream");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_client() -> Machine {
        let mut machine = Machine::default();
        machine.apply(Transition::StartClient).unwrap();
        machine.apply(Transition::Established).unwrap();
        machine
    }

    #[test]
    fn test_predicates() {
        assert!(!State::Inactive.is_running());
        assert!(State::ServerRunning.is_running());
        assert!(State::ServerRunning.is_server());
        assert!(!State::ServerRunning.is_connected());
        assert!(State::ClientConnected.is_connected());
        assert!(State::ClientConnected.is_client());
        assert!(!State::ClientConnected.is_server());
        assert!(!State::Inactive.is_client());
        assert!(!State::Inactive.is_server());
    }

    #[test]
    fn test_server_lifecycle() {
        let mut machine = Machine::default();
        assert_eq!(
            machine.apply(Transition::StartServer),
            Ok(State::ServerRunning)
        );
        assert_eq!(
            machine.apply(Transition::Established),
            Ok(State::ServerConnected)
        );
        assert_eq!(machine.apply(Transition::Disconnect), Ok(State::Inactive));
    }

    #[test]
    fn test_failed_start_returns_to_inactive() {
        let mut machine = Machine::default();
        machine.apply(Transition::StartClient).unwrap();
        assert_eq!(
            machine.apply(Transition::EstablishFailed),
            Ok(State::Inactive)
        );
    }

    #[test]
    fn test_start_only_from_inactive() {
        let mut machine = Machine::default();
        machine.apply(Transition::StartServer).unwrap();
        assert_eq!(machine.apply(Transition::StartClient), Err(ErrorKind::Busy));
        assert_eq!(machine.apply(Transition::StartServer), Err(ErrorKind::Busy));
        assert_eq!(machine.state(), State::ServerRunning);
    }

    #[test]
    fn test_io_requires_connection() {
        let mut machine = Machine::default();
        assert_eq!(
            machine.apply(Transition::BeginIo),
            Err(ErrorKind::Disconnected)
        );
        machine.apply(Transition::StartClient).unwrap();
        assert_eq!(
            machine.apply(Transition::BeginIo),
            Err(ErrorKind::Disconnected)
        );
        assert!(!machine.io_in_progress());
    }

    #[test]
    fn test_second_io_is_busy() {
        let mut machine = connected_client();
        assert_eq!(
            machine.apply(Transition::BeginIo),
            Ok(State::ClientConnected)
        );
        assert!(machine.io_in_progress());
        assert_eq!(machine.apply(Transition::BeginIo), Err(ErrorKind::Busy));

        machine.apply(Transition::EndIo).unwrap();
        assert!(!machine.io_in_progress());
        assert!(machine.apply(Transition::BeginIo).is_ok());
    }

    #[test]
    fn test_disconnect_clears_io_and_is_rejected_when_inactive() {
        let mut machine = connected_client();
        machine.apply(Transition::BeginIo).unwrap();
        assert_eq!(machine.apply(Transition::Disconnect), Ok(State::Inactive));
        assert!(!machine.io_in_progress());
        assert_eq!(
            machine.apply(Transition::Disconnect),
            Err(ErrorKind::Disconnected)
        );
    }

    #[test]
    fn test_late_establish_after_disconnect_is_rejected() {
        let mut machine = Machine::default();
        machine.apply(Transition::StartServer).unwrap();
        machine.apply(Transition::Disconnect).unwrap();
        assert_eq!(
            machine.apply(Transition::Established),
            Err(ErrorKind::Disconnected)
        );
        assert_eq!(machine.state(), State::Inactive);
    }

    #[test]
    fn test_session_ignores_stale_tokens() {
        let mut session = Session::default();
        let first = session.start(Transition::StartServer).unwrap();
        assert!(session.close());
        assert!(!session.close());

        let second = session.start(Transition::StartClient).unwrap();
        assert!(!session.abort_start(&first));
        assert_eq!(session.state(), State::ClientRunning);
        assert!(session.abort_start(&second));
        assert_eq!(session.state(), State::Inactive);
    }

    #[test]
    fn test_begin_io_without_stream() {
        let mut session = Session::default();
        assert_eq!(
            session.begin_io().map(|_| ()),
            Err(ErrorKind::Disconnected)
        );
    }
}
