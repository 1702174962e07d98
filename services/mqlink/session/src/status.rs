//! Connection lifecycle state machine.

use crate::error::{ClientError, OperationKind, TransitionError};
use crate::options::{ClientOptions, OfflinePolicy};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of the network session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session
    #[default]
    Disconnected,
    /// Initial connect in progress
    Connecting,
    /// Session established
    Connected,
    /// Transport lost, re-establishing
    Reconnecting,
    /// Orderly shutdown in progress
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// How an operation is treated in the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Send it now
    Proceed,
    /// Hold it until the session is re-established
    Defer,
    /// Fail it immediately
    Reject(ClientError),
}

impl ConnectionState {
    /// Whether `self -> to` is an allowed edge
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Disconnecting)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnecting)
                | (Reconnecting, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    /// Decide whether a session operation may run in this state
    pub fn admission(self, op: OperationKind, options: &ClientOptions) -> Admission {
        match self {
            ConnectionState::Connected => Admission::Proceed,
            ConnectionState::Reconnecting
                if op == OperationKind::Subscribe
                    && !options.clean_session
                    && options.resume_subs
                    && options.offline_policy == OfflinePolicy::QueueWhileReconnecting =>
            {
                Admission::Defer
            }
            _ => Admission::Reject(ClientError::NotConnected),
        }
    }
}

/// Owner of the connection state.
///
/// Reads are a short lock on the current value; every change is published to
/// subscribers so tasks can await a particular state.
#[derive(Debug)]
pub struct ConnectionStatus {
    state: watch::Sender<ConnectionState>,
}

impl ConnectionStatus {
    /// Start in `Disconnected`
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self { state }
    }

    /// Current state
    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Set the state unconditionally
    pub fn force(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            debug!("Connection status forced from {} to {}", from, to);
        }
    }

    /// Move to `to` if the edge is allowed, returning the previous state
    pub fn transition(&self, to: ConnectionState) -> Result<ConnectionState, TransitionError> {
        self.transition_when(to, |_| true)
    }

    /// Move from exactly `expected` to `to`; fails if another transition won
    pub fn transition_from(
        &self,
        expected: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), TransitionError> {
        self.transition_when(to, |from| from == expected).map(|_| ())
    }

    fn transition_when(
        &self,
        to: ConnectionState,
        accept: impl Fn(ConnectionState) -> bool,
    ) -> Result<ConnectionState, TransitionError> {
        let mut result = Err(TransitionError {
            from: ConnectionState::Disconnected,
            to,
        });

        self.state.send_if_modified(|state| {
            let from = *state;
            if accept(from) && from.can_transition_to(to) {
                *state = to;
                result = Ok(from);
                true
            } else {
                result = Err(TransitionError { from, to });
                false
            }
        });

        if let Ok(from) = result {
            debug!("Connection status {} -> {}", from, to);
        }
        result
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let status = ConnectionStatus::new();
        assert_eq!(status.current(), ConnectionState::Disconnected);

        assert!(status.transition(ConnectionState::Connected).is_err());
        assert_eq!(
            status.transition(ConnectionState::Connecting).unwrap(),
            ConnectionState::Disconnected
        );
        status.transition(ConnectionState::Connected).unwrap();
        status.transition(ConnectionState::Reconnecting).unwrap();
        status.transition(ConnectionState::Connected).unwrap();
        status.transition(ConnectionState::Disconnecting).unwrap();

        let err = status.transition(ConnectionState::Connected).unwrap_err();
        assert_eq!(err.from, ConnectionState::Disconnecting);
        assert_eq!(status.current(), ConnectionState::Disconnecting);

        status.transition(ConnectionState::Disconnected).unwrap();
    }

    #[test]
    fn test_transition_from_requires_expected_state() {
        let status = ConnectionStatus::new();
        status.force(ConnectionState::Disconnecting);

        let err = status
            .transition_from(ConnectionState::Connected, ConnectionState::Disconnected)
            .unwrap_err();
        assert_eq!(err.from, ConnectionState::Disconnecting);
        assert_eq!(status.current(), ConnectionState::Disconnecting);

        status.force(ConnectionState::Connected);
        status
            .transition_from(ConnectionState::Connected, ConnectionState::Reconnecting)
            .unwrap();
        assert_eq!(status.current(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_force() {
        let status = ConnectionStatus::new();
        status.force(ConnectionState::Reconnecting);
        assert_eq!(status.current(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_watchers_see_changes() {
        let status = ConnectionStatus::new();
        let mut rx = status.subscribe();
        status.transition(ConnectionState::Connecting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn test_admission() {
        let options = ClientOptions::default();
        assert_eq!(
            ConnectionState::Connected.admission(OperationKind::Subscribe, &options),
            Admission::Proceed
        );
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Disconnecting,
        ] {
            assert_eq!(
                state.admission(OperationKind::Subscribe, &options),
                Admission::Reject(ClientError::NotConnected)
            );
        }

        let resumable = ClientOptions::default()
            .with_clean_session(false)
            .with_resume_subs(true)
            .with_offline_policy(OfflinePolicy::QueueWhileReconnecting);
        assert_eq!(
            ConnectionState::Reconnecting.admission(OperationKind::Subscribe, &resumable),
            Admission::Defer
        );
        assert_eq!(
            ConnectionState::Reconnecting.admission(OperationKind::Publish, &resumable),
            Admission::Reject(ClientError::NotConnected)
        );
        assert_eq!(
            ConnectionState::Disconnected.admission(OperationKind::Subscribe, &resumable),
            Admission::Reject(ClientError::NotConnected)
        );

        let no_resume = resumable.clone().with_resume_subs(false);
        assert_eq!(
            ConnectionState::Reconnecting.admission(OperationKind::Subscribe, &no_resume),
            Admission::Reject(ClientError::NotConnected)
        );
    }
}
