//! Client session engine for mqlink.
//!
//! The engine owns one broker connection at a time and tracks every
//! operation submitted through [`Client`] until it completes:
//!
//! - [`status`]: the connection lifecycle state machine and the admission
//!   rules that decide whether an operation may run, wait or fail
//! - [`ids`]: message identifier allocation and the pending operation table
//! - [`dispatch`]: the bounded queue feeding the single writer task
//! - [`registry`]: subscriptions remembered for replay after a reconnect
//! - [`token`]: completion tokens returned to callers
//!
//! ## Task layout
//!
//! ```text
//!   Client ──submit──▶ DispatchQueue ──▶ writer task ──▶ transport
//!     │                                      ▲
//!     └──commands──▶ coordinator             │ PUBACK/PUBREL/...
//!                       │                    │
//!                       └── reader task ─────┘──▶ router ──▶ handlers
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
mod connection;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod keepalive;
pub mod options;
pub mod registry;
pub mod router;
pub mod status;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use client::Client;
pub use error::{ClientError, OperationError, OperationKind, TransitionError};
pub use options::{
    ClientOptions, ConnectionLostHandler, OfflinePolicy, OnConnectHandler, ReconnectingHandler,
    ReplayErrorHandler,
};
pub use registry::SubscriptionRecord;
pub use router::{Message, MessageHandler, MessageRouter};
pub use status::{Admission, ConnectionState};
pub use token::{Completion, Token};
pub use transport::{BoxedStream, Dialer, TcpDialer};

pub use mqlink_wire::QoS;
