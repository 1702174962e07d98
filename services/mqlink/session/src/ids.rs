//! Message identifier allocation and pending operation tracking.

use crate::error::ClientError;
use crate::registry::SubscriptionRecord;
use crate::token::{Completion, Token};
use mqlink_wire::QoS;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Largest message identifier; 0 is never handed out
pub const MAX_MESSAGE_ID: u16 = u16::MAX;

/// What an outstanding identifier is waiting for
#[derive(Debug, Clone)]
pub enum PendingKind {
    /// SUBACK for these records
    Subscribe(Vec<SubscriptionRecord>),
    /// UNSUBACK for these filters
    Unsubscribe(Vec<String>),
    /// PUBACK (QoS 1) or PUBCOMP (QoS 2)
    Publish(QoS),
}

/// Operation holding an identifier until its acknowledgement arrives
#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// Operation details
    pub kind: PendingKind,
    /// Token resolved on acknowledgement or abandonment
    pub token: Token,
}

impl PendingOperation {
    /// Create a pending operation
    pub fn new(kind: PendingKind, token: Token) -> Self {
        Self { kind, token }
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    pending: HashMap<u16, PendingOperation>,
    cursor: u16,
}

/// Hands out unique identifiers in `1..=65535`
#[derive(Debug, Default)]
pub struct IdAllocator {
    state: Mutex<AllocatorState>,
}

impl IdAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a free identifier for `op`; never blocks
    pub fn reserve(&self, op: PendingOperation) -> Result<u16, ClientError> {
        let mut state = self.lock();
        if state.pending.len() >= MAX_MESSAGE_ID as usize {
            return Err(ClientError::IdentifierSpaceExhausted);
        }

        let mut id = state.cursor;
        loop {
            id = if id == MAX_MESSAGE_ID { 1 } else { id + 1 };
            if !state.pending.contains_key(&id) {
                break;
            }
        }

        state.cursor = id;
        state.pending.insert(id, op);
        Ok(id)
    }

    /// Whether `id` is outstanding
    pub fn is_pending(&self, id: u16) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Remove the operation for `id` if `accept` agrees it is the right kind
    pub fn take_if(
        &self,
        id: u16,
        accept: impl FnOnce(&PendingKind) -> bool,
    ) -> Option<PendingOperation> {
        let mut state = self.lock();
        let accepted = state.pending.get(&id).map(|op| accept(&op.kind));
        match accepted {
            Some(true) => state.pending.remove(&id),
            Some(false) => {
                warn!("Acknowledgement for message id {} does not match its operation", id);
                None
            }
            None => {
                debug!("Acknowledgement for unknown message id {}", id);
                None
            }
        }
    }

    /// Remove the operation for `id`
    pub fn take(&self, id: u16) -> Option<PendingOperation> {
        self.lock().pending.remove(&id)
    }

    /// Free `id` and resolve its token with `result`
    pub fn resolve(&self, id: u16, result: Result<Completion, ClientError>) -> bool {
        match self.take(id) {
            Some(op) => op.token.resolve(result),
            None => {
                debug!("Ignoring resolution for unknown message id {}", id);
                false
            }
        }
    }

    /// Free `id`, failing its token with `cause`
    pub fn release(&self, id: u16, cause: ClientError) -> bool {
        self.resolve(id, Err(cause))
    }

    /// Abandon every outstanding operation; returns how many were released
    pub fn release_all(&self, cause: ClientError) -> usize {
        let drained: Vec<PendingOperation> = {
            let mut state = self.lock();
            state.pending.drain().map(|(_, op)| op).collect()
        };

        for op in &drained {
            op.token.fail(cause.clone());
        }
        if !drained.is_empty() {
            debug!("Released {} pending operations: {}", drained.len(), cause);
        }
        drained.len()
    }

    /// Number of outstanding identifiers
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether no identifiers are outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) fn publish_op(qos: QoS) -> PendingOperation {
    PendingOperation::new(
        PendingKind::Publish(qos),
        Token::new(crate::error::OperationKind::Publish),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_start_at_one_and_advance() {
        let ids = IdAllocator::new();
        assert_eq!(ids.reserve(publish_op(QoS::AtLeastOnce)).unwrap(), 1);
        assert_eq!(ids.reserve(publish_op(QoS::AtLeastOnce)).unwrap(), 2);
        ids.release(1, ClientError::ConnectionLost);
        // the cursor keeps moving rather than reusing 1 straight away
        assert_eq!(ids.reserve(publish_op(QoS::AtLeastOnce)).unwrap(), 3);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_exhaustion_and_wraparound() {
        let ids = IdAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..MAX_MESSAGE_ID {
            let id = ids.reserve(publish_op(QoS::AtLeastOnce)).unwrap();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }

        assert_eq!(
            ids.reserve(publish_op(QoS::AtLeastOnce)),
            Err(ClientError::IdentifierSpaceExhausted)
        );

        ids.release(42, ClientError::ConnectionLost);
        assert_eq!(ids.reserve(publish_op(QoS::AtLeastOnce)).unwrap(), 42);
    }

    #[test]
    fn test_concurrent_reserve_hands_out_distinct_ids() {
        let allocator = IdAllocator::new();
        let ids = &allocator;
        let per_thread = 2_000;

        let reserved: Vec<u16> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(move || {
                        (0..per_thread)
                            .map(|_| ids.reserve(publish_op(QoS::AtLeastOnce)).unwrap())
                            .collect::<Vec<u16>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let distinct: HashSet<u16> = reserved.iter().copied().collect();
        assert_eq!(distinct.len(), 8 * per_thread);
        assert!(!distinct.contains(&0));
        assert_eq!(ids.len(), 8 * per_thread);
    }

    #[test]
    fn test_resolve_unknown_id_is_ignored() {
        let ids = IdAllocator::new();
        assert!(!ids.resolve(9, Ok(Completion::Published)));
    }

    #[test]
    fn test_take_if_checks_kind() {
        let ids = IdAllocator::new();
        let id = ids.reserve(publish_op(QoS::ExactlyOnce)).unwrap();

        assert!(ids
            .take_if(id, |kind| matches!(kind, PendingKind::Publish(QoS::AtLeastOnce)))
            .is_none());
        assert!(ids.is_pending(id));
        assert!(ids
            .take_if(id, |kind| matches!(kind, PendingKind::Publish(QoS::ExactlyOnce)))
            .is_some());
        assert!(ids.is_empty());
    }

    #[test]
    fn test_release_all_fails_tokens() {
        let ids = IdAllocator::new();
        let first = publish_op(QoS::AtLeastOnce);
        let second = publish_op(QoS::ExactlyOnce);
        let tokens = [first.token.clone(), second.token.clone()];
        ids.reserve(first).unwrap();
        ids.reserve(second).unwrap();

        assert_eq!(ids.release_all(ClientError::ConnectionLost), 2);
        assert!(ids.is_empty());
        for token in tokens {
            assert_eq!(token.error().unwrap().cause, ClientError::ConnectionLost);
        }
    }
}
