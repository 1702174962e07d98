//! Client configuration.

use crate::error::{ClientError, OperationError};
use crate::router::MessageHandler;
use bytes::Bytes;
use mqlink_wire::{Connect, LastWill, QoS};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Called after every successful (re)connect with the session-present flag
pub type OnConnectHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Called when an established connection drops
pub type ConnectionLostHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Called before each reconnect attempt with the attempt number
pub type ReconnectingHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Called when replaying a subscription after a reconnect fails
pub type ReplayErrorHandler = Arc<dyn Fn(&str, &OperationError) + Send + Sync>;

/// What happens to operations submitted while the session is down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfflinePolicy {
    /// Fail with `NotConnected`
    #[default]
    FailFast,
    /// Hold subscribes while reconnecting a resumable session
    QueueWhileReconnecting,
}

/// Options for a client instance
#[derive(Clone)]
pub struct ClientOptions {
    /// Broker address, `host:port` with an optional `tcp://` or `mqtt://` scheme
    pub broker: String,
    /// Client identifier
    pub client_id: String,
    /// User name for authentication
    pub username: Option<String>,
    /// Password for authentication
    pub password: Option<String>,
    /// Start every connection with a clean session
    pub clean_session: bool,
    /// Replay subscriptions after a reconnect
    pub resume_subs: bool,
    /// Reconnect automatically when the connection drops
    pub auto_reconnect: bool,
    /// Keep retrying the initial connect instead of failing
    pub connect_retry: bool,
    /// Delay between initial connect attempts
    pub connect_retry_interval: Duration,
    /// Upper bound on the reconnect backoff
    pub max_reconnect_interval: Duration,
    /// Keep alive interval; zero disables PINGREQ
    pub keep_alive: Duration,
    /// How long to wait for PINGRESP
    pub ping_timeout: Duration,
    /// Time allowed for dialing and the CONNECT/CONNACK exchange
    pub connect_timeout: Duration,
    /// Time allowed for a write to enter the dispatch queue; zero waits forever
    pub write_timeout: Duration,
    /// Dispatch queue capacity; zero makes every submit a rendezvous
    pub dispatch_capacity: usize,
    /// Behavior for submissions while the session is down
    pub offline_policy: OfflinePolicy,
    /// Will message registered on connect
    pub will: Option<LastWill>,
    /// Deliver messages on the reader task, in order
    pub order_matters: bool,
    /// Handler for messages no subscription claims
    pub default_handler: Option<MessageHandler>,
    /// Connect callback
    pub on_connect: Option<OnConnectHandler>,
    /// Connection lost callback
    pub on_connection_lost: Option<ConnectionLostHandler>,
    /// Reconnecting callback
    pub on_reconnecting: Option<ReconnectingHandler>,
    /// Subscription replay failure callback
    pub on_replay_error: Option<ReplayErrorHandler>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            clean_session: true,
            resume_subs: false,
            auto_reconnect: true,
            connect_retry: false,
            connect_retry_interval: Duration::from_secs(30),
            max_reconnect_interval: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            write_timeout: Duration::ZERO,
            dispatch_capacity: 100,
            offline_policy: OfflinePolicy::FailFast,
            will: None,
            order_matters: true,
            default_handler: None,
            on_connect: None,
            on_connection_lost: None,
            on_reconnecting: None,
            on_replay_error: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("clean_session", &self.clean_session)
            .field("resume_subs", &self.resume_subs)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("connect_retry", &self.connect_retry)
            .field("keep_alive", &self.keep_alive)
            .field("write_timeout", &self.write_timeout)
            .field("dispatch_capacity", &self.dispatch_capacity)
            .field("offline_policy", &self.offline_policy)
            .field("order_matters", &self.order_matters)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    /// Options for `broker` with defaults elsewhere
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            ..Self::default()
        }
    }

    /// Set the broker address
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    /// Set the client identifier
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Set the clean session flag
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Enable or disable subscription replay
    pub fn with_resume_subs(mut self, resume_subs: bool) -> Self {
        self.resume_subs = resume_subs;
        self
    }

    /// Enable or disable automatic reconnect
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Retry the initial connect every `interval`
    pub fn with_connect_retry(mut self, connect_retry: bool, interval: Duration) -> Self {
        self.connect_retry = connect_retry;
        self.connect_retry_interval = interval;
        self
    }

    /// Cap the reconnect backoff
    pub fn with_max_reconnect_interval(mut self, interval: Duration) -> Self {
        self.max_reconnect_interval = interval;
        self
    }

    /// Set the keep alive interval
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the PINGRESP timeout
    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the dispatch write timeout
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Set the dispatch queue capacity
    pub fn with_dispatch_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_capacity = capacity;
        self
    }

    /// Set the offline policy
    pub fn with_offline_policy(mut self, policy: OfflinePolicy) -> Self {
        self.offline_policy = policy;
        self
    }

    /// Register a will message
    pub fn with_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.will = Some(LastWill {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        });
        self
    }

    /// Deliver messages in order on the reader task, or concurrently
    pub fn with_order_matters(mut self, order_matters: bool) -> Self {
        self.order_matters = order_matters;
        self
    }

    /// Handler for messages without a matching subscription
    pub fn with_default_handler(mut self, handler: MessageHandler) -> Self {
        self.default_handler = Some(handler);
        self
    }

    /// Connect callback
    pub fn with_on_connect(mut self, handler: OnConnectHandler) -> Self {
        self.on_connect = Some(handler);
        self
    }

    /// Connection lost callback
    pub fn with_on_connection_lost(mut self, handler: ConnectionLostHandler) -> Self {
        self.on_connection_lost = Some(handler);
        self
    }

    /// Reconnecting callback
    pub fn with_on_reconnecting(mut self, handler: ReconnectingHandler) -> Self {
        self.on_reconnecting = Some(handler);
        self
    }

    /// Replay failure callback
    pub fn with_on_replay_error(mut self, handler: ReplayErrorHandler) -> Self {
        self.on_replay_error = Some(handler);
        self
    }

    /// Broker address with any URL scheme removed
    pub fn broker_addr(&self) -> &str {
        ["tcp://", "mqtt://"]
            .iter()
            .find_map(|scheme| self.broker.strip_prefix(scheme))
            .unwrap_or(&self.broker)
    }

    /// Check option combinations that can never work
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.client_id.is_empty() && !self.clean_session {
            return Err(ClientError::InvalidArgument(
                "an empty client id requires a clean session".to_string(),
            ));
        }
        if self.keep_alive.as_secs() > u16::MAX as u64 {
            return Err(ClientError::InvalidArgument(format!(
                "keep alive {:?} exceeds {} seconds",
                self.keep_alive,
                u16::MAX
            )));
        }
        Ok(())
    }

    /// CONNECT packet for these options
    pub fn connect_packet(&self) -> Connect {
        Connect {
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            keep_alive: self.keep_alive.as_secs().min(u16::MAX as u64) as u16,
            username: self.username.clone(),
            password: self.password.clone().map(Bytes::from),
            will: self.will.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::default();
        assert!(options.clean_session);
        assert!(!options.resume_subs);
        assert!(options.auto_reconnect);
        assert_eq!(options.write_timeout, Duration::ZERO);
        assert_eq!(options.max_reconnect_interval, Duration::from_secs(30));
        assert_eq!(options.offline_policy, OfflinePolicy::FailFast);
    }

    #[test]
    fn test_broker_addr_strips_scheme() {
        assert_eq!(ClientOptions::new("tcp://broker:1883").broker_addr(), "broker:1883");
        assert_eq!(ClientOptions::new("mqtt://broker:1883").broker_addr(), "broker:1883");
        assert_eq!(ClientOptions::new("broker:1883").broker_addr(), "broker:1883");
    }

    #[test]
    fn test_validate() {
        assert!(ClientOptions::default().validate().is_ok());
        assert!(ClientOptions::default()
            .with_clean_session(false)
            .validate()
            .is_err());
        assert!(ClientOptions::default()
            .with_client_id("c1")
            .with_clean_session(false)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_connect_packet() {
        let options = ClientOptions::new("localhost:1883")
            .with_client_id("c1")
            .with_credentials("alice", Some("pw".to_string()))
            .with_keep_alive(Duration::from_secs(45))
            .with_will("status/c1", "gone", QoS::AtLeastOnce, true);

        let connect = options.connect_packet();
        assert_eq!(connect.client_id, "c1");
        assert_eq!(connect.keep_alive, 45);
        assert_eq!(connect.password, Some(Bytes::from_static(b"pw")));
        assert_eq!(connect.will.unwrap().topic, "status/c1");
    }
}
