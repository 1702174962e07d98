//! Delivery of inbound messages to subscription callbacks.

use bytes::Bytes;
use dashmap::DashMap;
use mqlink_wire::{topic_matches, Publish, QoS};
use std::sync::Arc;
use tracing::{debug, trace};

/// Callback invoked for each delivered message
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published to
    pub topic: String,
    /// Delivery QoS
    pub qos: QoS,
    /// Retained flag
    pub retain: bool,
    /// Redelivery flag
    pub dup: bool,
    /// Packet identifier for QoS > 0
    pub packet_id: Option<u16>,
    /// Payload
    pub payload: Bytes,
}

impl From<Publish> for Message {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            qos: publish.qos,
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
            payload: publish.payload,
        }
    }
}

/// Routes messages by topic filter
pub struct MessageRouter {
    routes: DashMap<String, MessageHandler>,
    default_handler: Option<MessageHandler>,
}

impl MessageRouter {
    /// Create a router with an optional fallback handler
    pub fn new(default_handler: Option<MessageHandler>) -> Self {
        Self {
            routes: DashMap::new(),
            default_handler,
        }
    }

    /// Route messages matching `filter` to `handler`
    pub fn add_route(&self, filter: &str, handler: MessageHandler) {
        self.routes.insert(filter.to_string(), handler);
    }

    /// Stop routing `filter`
    pub fn remove_route(&self, filter: &str) -> bool {
        self.routes.remove(filter).is_some()
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver `message`; returns the number of handlers invoked
    pub fn route(&self, message: Message) -> usize {
        // Collect first so no map shard is locked while user code runs.
        let handlers: Vec<MessageHandler> = self
            .routes
            .iter()
            .filter(|entry| topic_matches(entry.key(), &message.topic))
            .map(|entry| entry.value().clone())
            .collect();

        if handlers.is_empty() {
            return match &self.default_handler {
                Some(handler) => {
                    trace!("Delivering {} to default handler", message.topic);
                    handler(message);
                    1
                }
                None => {
                    debug!("No handler for message on {}", message.topic);
                    0
                }
            };
        }

        let count = handlers.len();
        for handler in handlers {
            handler(message.clone());
        }
        count
    }
}
