//! Subscriptions remembered for replay after a reconnect.

use crate::error::ClientError;
use crate::router::MessageHandler;
use crate::token::Token;
use mqlink_wire::QoS;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// An active subscription
#[derive(Clone)]
pub struct SubscriptionRecord {
    /// Topic filter
    pub filter: String,
    /// Requested QoS
    pub qos: QoS,
    /// Delivery callback; `None` falls back to the default handler
    pub handler: Option<MessageHandler>,
}

impl SubscriptionRecord {
    /// Create a record
    pub fn new(filter: impl Into<String>, qos: QoS, handler: Option<MessageHandler>) -> Self {
        Self {
            filter: filter.into(),
            qos,
            handler,
        }
    }
}

impl fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Subscribe accepted while reconnecting, issued once the session is back
#[derive(Debug)]
pub struct DeferredSubscribe {
    /// Records of the original request
    pub records: Vec<SubscriptionRecord>,
    /// Caller's token
    pub token: Token,
}

/// Work to do once a reconnect succeeds
#[derive(Debug, Default)]
pub struct ReplayPlan {
    /// Previously acknowledged subscriptions, each replayed on its own
    pub records: Vec<SubscriptionRecord>,
    /// Subscribes queued while reconnecting
    pub deferred: Vec<DeferredSubscribe>,
}

impl ReplayPlan {
    /// Whether there is nothing to replay
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.deferred.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    records: BTreeMap<String, SubscriptionRecord>,
    deferred: Vec<DeferredSubscribe>,
}

/// Subscription resume registry
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember an acknowledged subscription; the last write for a filter wins
    pub fn record(&self, record: SubscriptionRecord) {
        debug!("Recorded subscription {} (qos {})", record.filter, record.qos);
        self.lock().records.insert(record.filter.clone(), record);
    }

    /// Forget the subscription for `filter`
    pub fn remove(&self, filter: &str) -> Option<SubscriptionRecord> {
        self.lock().records.remove(filter)
    }

    /// Look up the subscription for `filter`
    pub fn get(&self, filter: &str) -> Option<SubscriptionRecord> {
        self.lock().records.get(filter).cloned()
    }

    /// Snapshot of the recorded subscriptions, ordered by filter
    pub fn records(&self) -> Vec<SubscriptionRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Hold a subscribe for replay if `still_offline` holds under the lock.
    ///
    /// Returns the records back when the condition no longer holds.
    pub fn defer_if(
        &self,
        still_offline: impl FnOnce() -> bool,
        records: Vec<SubscriptionRecord>,
        token: Token,
    ) -> Result<(), Vec<SubscriptionRecord>> {
        let mut state = self.lock();
        if !still_offline() {
            return Err(records);
        }
        debug!("Deferred subscribe for {} filter(s) until reconnected", records.len());
        state.deferred.push(DeferredSubscribe { records, token });
        Ok(())
    }

    /// Take what must be replayed after a reconnect.
    ///
    /// Recorded subscriptions stay in place; deferred subscribes move out.
    pub fn take_replay(&self) -> ReplayPlan {
        let mut state = self.lock();
        ReplayPlan {
            records: state.records.values().cloned().collect(),
            deferred: std::mem::take(&mut state.deferred),
        }
    }

    /// Fail deferred subscribes with `NotConnected`, keeping the records
    pub fn abandon_deferred(&self) -> usize {
        let deferred = std::mem::take(&mut self.lock().deferred);
        for entry in &deferred {
            entry.token.fail(ClientError::NotConnected);
        }
        deferred.len()
    }

    /// Forget everything; deferred subscribes fail with `NotConnected`
    pub fn clear(&self) -> usize {
        let cleared = std::mem::take(&mut self.lock().records).len();
        let abandoned = self.abandon_deferred();
        if cleared + abandoned > 0 {
            debug!(
                "Cleared subscription registry ({} records, {} deferred)",
                cleared, abandoned
            );
        }
        cleared
    }

    /// Number of recorded subscriptions
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether no subscriptions are recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of subscribes waiting for the reconnect
    pub fn deferred_len(&self) -> usize {
        self.lock().deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationKind;

    #[test]
    fn test_last_write_wins() {
        let registry = SubscriptionRegistry::new();
        registry.record(SubscriptionRecord::new("a/b", QoS::AtMostOnce, None));
        registry.record(SubscriptionRecord::new("a/b", QoS::ExactlyOnce, None));
        registry.record(SubscriptionRecord::new("a/c", QoS::AtLeastOnce, None));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a/b").unwrap().qos, QoS::ExactlyOnce);

        assert!(registry.remove("a/b").is_some());
        assert!(registry.remove("a/b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_take_replay_keeps_records() {
        let registry = SubscriptionRegistry::new();
        registry.record(SubscriptionRecord::new("x", QoS::AtLeastOnce, None));
        let token = Token::new(OperationKind::Subscribe);
        registry
            .defer_if(|| true, vec![SubscriptionRecord::new("y", QoS::AtMostOnce, None)], token)
            .unwrap();

        let plan = registry.take_replay();
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.deferred.len(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.deferred_len(), 0);
    }

    #[test]
    fn test_defer_refused_when_back_online() {
        let registry = SubscriptionRegistry::new();
        let records = vec![SubscriptionRecord::new("y", QoS::AtMostOnce, None)];
        let returned = registry
            .defer_if(|| false, records, Token::new(OperationKind::Subscribe))
            .unwrap_err();
        assert_eq!(returned.len(), 1);
        assert_eq!(registry.deferred_len(), 0);
    }

    #[test]
    fn test_clear_fails_deferred() {
        let registry = SubscriptionRegistry::new();
        registry.record(SubscriptionRecord::new("x", QoS::AtLeastOnce, None));
        let token = Token::new(OperationKind::Subscribe);
        registry
            .defer_if(
                || true,
                vec![SubscriptionRecord::new("y", QoS::AtMostOnce, None)],
                token.clone(),
            )
            .unwrap();

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert_eq!(token.error().unwrap().cause, ClientError::NotConnected);
    }
}
