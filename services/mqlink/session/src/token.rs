//! Completion tokens handed back to callers.
//!
//! A [`Token`] is resolved exactly once by whichever engine task learns the
//! outcome of the operation. Callers may clone it freely and wait from any
//! task; all waiters observe the same outcome.

use crate::error::{ClientError, OperationError, OperationKind};
use mqlink_wire::QoS;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

/// Successful outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Broker accepted the connection
    Connected {
        /// Broker resumed a stored session
        session_present: bool,
    },
    /// Broker granted the subscription(s)
    Subscribed {
        /// Granted QoS, one per requested filter
        granted: Vec<QoS>,
    },
    /// Broker acknowledged the unsubscribe
    Unsubscribed,
    /// Publish completed its delivery flow
    Published,
    /// Session shut down
    Disconnected,
}

#[derive(Debug)]
struct TokenInner {
    kind: OperationKind,
    outcome: OnceLock<Result<Completion, OperationError>>,
    done: watch::Sender<bool>,
}

/// Single-resolution handle on an operation's outcome
#[derive(Debug, Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl Token {
    /// Create an unresolved token
    pub fn new(kind: OperationKind) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                kind,
                outcome: OnceLock::new(),
                done,
            }),
        }
    }

    /// Create a token already resolved with `cause`
    pub fn failed(kind: OperationKind, cause: ClientError) -> Self {
        let token = Self::new(kind);
        token.fail(cause);
        token
    }

    /// Operation this token tracks
    pub fn kind(&self) -> OperationKind {
        self.inner.kind
    }

    /// Resolve the token.
    ///
    /// Returns `false` if it was already resolved; the first outcome is kept
    /// and waiters are not signalled again.
    pub fn resolve(&self, result: Result<Completion, ClientError>) -> bool {
        let outcome = result.map_err(|cause| OperationError::new(self.inner.kind, cause));
        if self.inner.outcome.set(outcome).is_err() {
            return false;
        }
        self.inner.done.send_replace(true);
        true
    }

    /// Resolve successfully
    pub fn complete(&self, completion: Completion) -> bool {
        self.resolve(Ok(completion))
    }

    /// Resolve with a failure
    pub fn fail(&self, cause: ClientError) -> bool {
        self.resolve(Err(cause))
    }

    /// Whether the token has been resolved
    pub fn is_complete(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Wait until the token is resolved
    pub async fn wait(&self) -> bool {
        let mut done = self.inner.done.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = done.wait_for(|resolved| *resolved).await;
        true
    }

    /// Wait up to `timeout`; returns `false` if still unresolved
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// The failure, if the token resolved with one
    pub fn error(&self) -> Option<OperationError> {
        match self.inner.outcome.get() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// The full outcome, if resolved
    pub fn result(&self) -> Option<Result<Completion, OperationError>> {
        self.inner.outcome.get().cloned()
    }

    /// The successful outcome, if resolved with one
    pub fn completion(&self) -> Option<Completion> {
        match self.inner.outcome.get() {
            Some(Ok(completion)) => Some(completion.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let token = Token::new(OperationKind::Subscribe);
        assert!(!token.is_complete());
        assert!(token.error().is_none());

        assert!(token.fail(ClientError::ConnectionLost));
        assert!(!token.complete(Completion::Unsubscribed));
        assert!(!token.fail(ClientError::NotConnected));

        assert!(token.wait().await);
        let err = token.error().unwrap();
        assert_eq!(err.cause, ClientError::ConnectionLost);
        assert!(err.to_string().contains("subscribe failed"));
    }

    #[tokio::test]
    async fn test_all_waiters_released() {
        let token = Token::new(OperationKind::Publish);
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let token = token.clone();
            waiters.push(tokio::spawn(async move { token.wait().await }));
        }

        tokio::task::yield_now().await;
        token.complete(Completion::Published);
        token.complete(Completion::Published);

        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(token.completion(), Some(Completion::Published));
    }

    #[tokio::test]
    async fn test_wait_timeout_unresolved() {
        let token = Token::new(OperationKind::Connect);
        assert!(!token.wait_timeout(Duration::from_millis(10)).await);
        assert!(!token.is_complete());
    }

    #[tokio::test]
    async fn test_wait_after_resolution() {
        let token = Token::failed(OperationKind::Unsubscribe, ClientError::NotConnected);
        assert!(token.wait_timeout(Duration::from_millis(10)).await);
        assert!(token.completion().is_none());
        assert_eq!(token.kind(), OperationKind::Unsubscribe);
    }
}
