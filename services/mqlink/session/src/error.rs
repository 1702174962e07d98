//! Error types for the client engine.

use crate::status::ConnectionState;
use mqlink_wire::{ConnectReturnCode, WireError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Operations a caller can initiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Session establishment
    Connect,
    /// Subscribe to one or more filters
    Subscribe,
    /// Remove one or more subscriptions
    Unsubscribe,
    /// Publish a message
    Publish,
    /// Orderly session shutdown
    Disconnect,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Connect => "connect",
            OperationKind::Subscribe => "subscribe",
            OperationKind::Unsubscribe => "unsubscribe",
            OperationKind::Publish => "publish",
            OperationKind::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Causes of a failed client operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The session is not in a state that accepts the operation
    #[error("not connected")]
    NotConnected,

    /// Caller supplied an invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// All 65535 message identifiers are in use
    #[error("no free message identifiers")]
    IdentifierSpaceExhausted,

    /// The dispatch queue did not accept the write in time
    #[error("dispatch timed out after {0:?}")]
    DispatchTimeout(Duration),

    /// The connection dropped before the operation completed
    #[error("connection lost")]
    ConnectionLost,

    /// Broker rejected the request
    #[error("broker rejected the request (code {0:#04x})")]
    ProtocolNack(u8),

    /// Broker refused the connection
    #[error("connection refused: {0}")]
    Refused(ConnectReturnCode),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Packet encoding or decoding failure
    #[error("codec error: {0}")]
    Codec(#[from] WireError),

    /// A connect was requested on an open session
    #[error("already connected")]
    AlreadyConnected,
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Failure delivered through a token
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed: {cause}")]
pub struct OperationError {
    /// Operation that failed
    pub op: OperationKind,
    /// Underlying cause
    #[source]
    pub cause: ClientError,
}

impl OperationError {
    /// Wrap a cause for the given operation
    pub fn new(op: OperationKind, cause: ClientError) -> Self {
        Self { op, cause }
    }
}

/// Rejected connection state change
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid connection state transition from {from} to {to}")]
pub struct TransitionError {
    /// State at the time of the request
    pub from: ConnectionState,
    /// Requested state
    pub to: ConnectionState,
}
