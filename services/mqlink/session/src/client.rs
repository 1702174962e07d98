//! Public client facade.
//!
//! Every operation validates its arguments, consults the connection state,
//! reserves a message identifier when the protocol needs one and hands the
//! encoded packet to the dispatch queue. The returned [`Token`] resolves when
//! the broker acknowledges the operation or when it is abandoned.

use crate::connection::{self, Command};
use crate::dispatch::{self, DispatchQueue, DispatchReceiver, QueuedWrite};
use crate::error::{ClientError, OperationKind};
use crate::ids::{IdAllocator, PendingKind, PendingOperation};
use crate::options::ClientOptions;
use crate::registry::{ReplayPlan, SubscriptionRecord, SubscriptionRegistry};
use crate::router::{MessageHandler, MessageRouter};
use crate::status::{Admission, ConnectionState, ConnectionStatus};
use crate::token::{Completion, Token};
use crate::transport::{Dialer, TcpDialer};
use bytes::Bytes;
use mqlink_wire::{
    validate_topic_filter, validate_topic_name, Packet, Publish, QoS, Subscribe, Unsubscribe,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// State shared by the facade and the connection tasks
pub(crate) struct Shared {
    pub(crate) options: ClientOptions,
    pub(crate) status: ConnectionStatus,
    pub(crate) ids: IdAllocator,
    pub(crate) queue: DispatchQueue,
    pub(crate) receiver: tokio::sync::Mutex<DispatchReceiver>,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) router: Arc<MessageRouter>,
    pub(crate) dialer: Arc<dyn Dialer>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl Shared {
    fn commands(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.commands.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn clear_commands(&self) {
        self.commands().take();
    }

    /// Release `id` (if any) and fail `token`
    pub(crate) fn abandon(&self, id: Option<u16>, token: &Token, cause: ClientError) {
        if let Some(id) = id {
            self.ids.release(id, cause.clone());
        }
        token.fail(cause);
    }

    /// Fail every pending operation and queued write with `cause`.
    ///
    /// The queue stays closed until the next link is established, so a
    /// submit racing the teardown fails instead of holding an identifier.
    pub(crate) fn abandon_in_flight(&self, cause: ClientError) {
        let drained = dispatch::fail_all(self.queue.close(), &cause);
        let released = self.ids.release_all(cause.clone());
        if released + drained > 0 {
            debug!(
                "Abandoned {} pending and {} queued operations: {}",
                released, drained, cause
            );
        }
    }

    /// Encode `packet` and queue it within the write timeout
    async fn dispatch(
        &self,
        packet: Packet,
        token: &Token,
        id: Option<u16>,
        on_write: Option<Completion>,
    ) {
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.abandon(id, token, err.into());
                return;
            }
        };

        let mut item = QueuedWrite::new(bytes, token.clone(), id);
        item.on_write = on_write;
        if let Err(cause) = self.queue.enqueue(item, self.options.write_timeout).await {
            warn!(
                "Failed to queue {:?} (id: {:?}): {}",
                packet.packet_type(),
                id,
                cause
            );
            self.abandon(id, token, cause);
        }
    }

    /// Reserve an identifier and queue a SUBSCRIBE for `records`
    pub(crate) async fn submit_subscribe(&self, records: Vec<SubscriptionRecord>, token: Token) {
        let filters: Vec<(String, QoS)> = records
            .iter()
            .map(|record| (record.filter.clone(), record.qos))
            .collect();

        let pending = PendingOperation::new(PendingKind::Subscribe(records), token.clone());
        let packet_id = match self.ids.reserve(pending) {
            Ok(id) => id,
            Err(cause) => {
                token.fail(cause);
                return;
            }
        };

        debug!("Queueing SUBSCRIBE (id: {}) for {:?}", packet_id, filters);
        let packet = Packet::Subscribe(Subscribe { packet_id, filters });
        self.dispatch(packet, &token, Some(packet_id), None).await;
    }

    /// Replay or forget subscriptions after a successful reconnect
    pub(crate) fn resume_after_reconnect(self: &Arc<Self>) {
        if !self.options.resume_subs || self.options.clean_session {
            self.registry.clear();
            return;
        }

        let plan = self.registry.take_replay();
        if plan.is_empty() {
            return;
        }

        info!(
            "Replaying {} subscriptions and {} deferred subscribes",
            plan.records.len(),
            plan.deferred.len()
        );
        let shared = self.clone();
        tokio::spawn(async move { shared.replay(plan).await });
    }

    async fn replay(&self, plan: ReplayPlan) {
        let mut replays = Vec::with_capacity(plan.records.len());
        for record in plan.records {
            let filter = record.filter.clone();
            let token = Token::new(OperationKind::Subscribe);
            self.submit_subscribe(vec![record], token.clone()).await;
            replays.push((filter, token));
        }

        for deferred in plan.deferred {
            self.submit_subscribe(deferred.records, deferred.token).await;
        }

        futures::future::join_all(replays.iter().map(|(_, token)| token.wait())).await;

        for (filter, token) in &replays {
            if let Some(err) = token.error() {
                warn!("Replaying subscription {} failed: {}", filter, err);
                if let Some(callback) = &self.options.on_replay_error {
                    callback(filter, &err);
                }
            }
        }
    }
}

/// Publish/subscribe client
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Create a client dialing `options.broker` over TCP
    pub fn new(options: ClientOptions) -> Self {
        let dialer = Arc::new(TcpDialer::new(options.broker_addr()));
        Self::with_dialer(options, dialer)
    }

    /// Create a client using a custom transport
    pub fn with_dialer(options: ClientOptions, dialer: Arc<dyn Dialer>) -> Self {
        let (queue, receiver) = dispatch::channel(options.dispatch_capacity);
        let router = Arc::new(MessageRouter::new(options.default_handler.clone()));

        Self {
            shared: Arc::new(Shared {
                options,
                status: ConnectionStatus::new(),
                ids: IdAllocator::new(),
                queue,
                receiver: tokio::sync::Mutex::new(receiver),
                registry: SubscriptionRegistry::new(),
                router,
                dialer,
                commands: Mutex::new(None),
            }),
        }
    }

    /// Client options
    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }

    /// Current connection state
    pub fn status(&self) -> ConnectionState {
        self.shared.status.current()
    }

    /// Watch connection state changes
    pub fn watch_status(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    /// Connected, or reconnecting with auto reconnect enabled
    pub fn is_connected(&self) -> bool {
        match self.status() {
            ConnectionState::Connected => true,
            ConnectionState::Reconnecting => self.shared.options.auto_reconnect,
            _ => false,
        }
    }

    /// Whether the session is established right now
    pub fn is_connection_open(&self) -> bool {
        self.status() == ConnectionState::Connected
    }

    /// Set the connection state directly
    pub fn force_connection_status(&self, state: ConnectionState) {
        self.shared.status.force(state);
    }

    /// Number of operations awaiting acknowledgement
    pub fn pending_operations(&self) -> usize {
        self.shared.ids.len()
    }

    /// Recorded subscriptions
    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.shared.registry.records()
    }

    /// Start connecting; the token resolves once CONNACK arrives
    pub fn connect(&self) -> Token {
        let token = Token::new(OperationKind::Connect);
        if let Err(cause) = self.shared.options.validate() {
            token.fail(cause);
            return token;
        }

        if let Err(err) = self.shared.status.transition(ConnectionState::Connecting) {
            let cause = match err.from {
                ConnectionState::Disconnecting => ClientError::NotConnected,
                _ => ClientError::AlreadyConnected,
            };
            token.fail(cause);
            return token;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.commands() = Some(tx);
        info!("Connecting to {}", self.shared.options.broker);
        tokio::spawn(connection::run(self.shared.clone(), rx, token.clone()));
        token
    }

    /// Shut the session down.
    ///
    /// Waits up to `quiesce` for in-flight operations, sends DISCONNECT and
    /// fails whatever is left with `ConnectionLost`.
    pub async fn disconnect(&self, quiesce: Duration) {
        if self.shared.status.transition(ConnectionState::Disconnecting).is_err() {
            debug!("Disconnect ignored in state {}", self.status());
            return;
        }

        let commands = self.shared.commands().take();
        if let Some(commands) = commands {
            let (done_tx, done_rx) = oneshot::channel();
            let command = Command::Disconnect {
                quiesce,
                done: done_tx,
            };
            if commands.send(command).is_ok() {
                let _ = done_rx.await;
                return;
            }
        }

        // No connection task; the state was set by hand.
        self.shared.abandon_in_flight(ClientError::ConnectionLost);
        self.shared.registry.abandon_deferred();
        self.shared.status.force(ConnectionState::Disconnected);
    }

    /// Subscribe to one filter
    pub async fn subscribe(&self, filter: &str, qos: u8, handler: Option<MessageHandler>) -> Token {
        self.subscribe_multiple(vec![(filter.to_string(), qos)], handler)
            .await
    }

    /// Subscribe to several filters in one request sharing `handler`
    pub async fn subscribe_multiple(
        &self,
        filters: Vec<(String, u8)>,
        handler: Option<MessageHandler>,
    ) -> Token {
        let token = Token::new(OperationKind::Subscribe);
        let records = match subscription_records(filters, handler) {
            Ok(records) => records,
            Err(cause) => {
                token.fail(cause);
                return token;
            }
        };

        let status = &self.shared.status;
        match status.current().admission(OperationKind::Subscribe, &self.shared.options) {
            Admission::Proceed => self.shared.submit_subscribe(records, token.clone()).await,
            Admission::Defer => {
                let deferred = self.shared.registry.defer_if(
                    || status.current() == ConnectionState::Reconnecting,
                    records,
                    token.clone(),
                );
                if let Err(records) = deferred {
                    if status.current() == ConnectionState::Connected {
                        self.shared.submit_subscribe(records, token.clone()).await;
                    } else {
                        token.fail(ClientError::NotConnected);
                    }
                }
            }
            Admission::Reject(cause) => {
                token.fail(cause);
            }
        }
        token
    }

    /// Remove subscriptions
    pub async fn unsubscribe(&self, filters: &[&str]) -> Token {
        let token = Token::new(OperationKind::Unsubscribe);
        if filters.is_empty() {
            token.fail(ClientError::InvalidArgument("no topic filters given".to_string()));
            return token;
        }
        for filter in filters {
            if let Err(cause) = check_filter(filter) {
                token.fail(cause);
                return token;
            }
        }

        if let Admission::Reject(cause) = self.admit(OperationKind::Unsubscribe) {
            token.fail(cause);
            return token;
        }
        let filters: Vec<String> = filters.iter().map(|filter| filter.to_string()).collect();

        let pending =
            PendingOperation::new(PendingKind::Unsubscribe(filters.clone()), token.clone());
        let packet_id = match self.shared.ids.reserve(pending) {
            Ok(id) => id,
            Err(cause) => {
                token.fail(cause);
                return token;
            }
        };

        debug!("Queueing UNSUBSCRIBE (id: {}) for {:?}", packet_id, filters);
        let packet = Packet::Unsubscribe(Unsubscribe { packet_id, filters });
        self.shared
            .dispatch(packet, &token, Some(packet_id), None)
            .await;
        token
    }

    /// Publish a message
    pub async fn publish(
        &self,
        topic: &str,
        qos: u8,
        retained: bool,
        payload: impl Into<Bytes>,
    ) -> Token {
        let token = Token::new(OperationKind::Publish);
        if let Err(err) = validate_topic_name(topic) {
            token.fail(ClientError::InvalidArgument(err.to_string()));
            return token;
        }
        let qos = match parse_qos(qos) {
            Ok(qos) => qos,
            Err(cause) => {
                token.fail(cause);
                return token;
            }
        };

        if let Admission::Reject(cause) = self.admit(OperationKind::Publish) {
            token.fail(cause);
            return token;
        }

        let mut publish = Publish {
            topic: topic.to_string(),
            qos,
            retain: retained,
            dup: false,
            packet_id: None,
            payload: payload.into(),
        };

        if qos == QoS::AtMostOnce {
            let packet = Packet::Publish(publish);
            self.shared
                .dispatch(packet, &token, None, Some(Completion::Published))
                .await;
            return token;
        }

        let pending = PendingOperation::new(PendingKind::Publish(qos), token.clone());
        let packet_id = match self.shared.ids.reserve(pending) {
            Ok(id) => id,
            Err(cause) => {
                token.fail(cause);
                return token;
            }
        };
        publish.packet_id = Some(packet_id);

        debug!("Queueing PUBLISH to {} (id: {}, qos {})", topic, packet_id, qos);
        self.shared
            .dispatch(Packet::Publish(publish), &token, Some(packet_id), None)
            .await;
        token
    }

    /// Gate for operations that are never deferred
    fn admit(&self, op: OperationKind) -> Admission {
        match self.status().admission(op, &self.shared.options) {
            Admission::Defer => Admission::Reject(ClientError::NotConnected),
            other => other,
        }
    }
}

fn parse_qos(qos: u8) -> Result<QoS, ClientError> {
    QoS::try_from(qos).map_err(|_| ClientError::InvalidArgument(format!("invalid qos {}", qos)))
}

fn check_filter(filter: &str) -> Result<(), ClientError> {
    if filter.is_empty() {
        return Err(ClientError::InvalidArgument(
            "topic filter must not be empty".to_string(),
        ));
    }
    validate_topic_filter(filter).map_err(|err| ClientError::InvalidArgument(err.to_string()))
}

fn subscription_records(
    filters: Vec<(String, u8)>,
    handler: Option<MessageHandler>,
) -> Result<Vec<SubscriptionRecord>, ClientError> {
    if filters.is_empty() {
        return Err(ClientError::InvalidArgument("no topic filters given".to_string()));
    }

    filters
        .into_iter()
        .map(|(filter, qos)| {
            check_filter(&filter)?;
            let qos = parse_qos(qos)?;
            Ok(SubscriptionRecord::new(filter, qos, handler.clone()))
        })
        .collect()
}
