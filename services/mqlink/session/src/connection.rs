//! Connection coordinator with its writer and reader tasks.
//!
//! One coordinator task runs per `connect()` cycle. It dials, performs the
//! CONNECT/CONNACK exchange, then spawns a writer task (sole owner of the
//! write half, fed by the dispatch queue and a reader-to-writer control
//! channel) and a reader task (sole owner of the read half, resolving
//! acknowledgements). When either ends the coordinator releases everything in
//! flight and reconnects with exponential backoff or shuts down.

use crate::client::Shared;
use crate::dispatch::QueuedWrite;
use crate::error::ClientError;
use crate::ids::PendingKind;
use crate::keepalive::{KeepaliveAction, KeepaliveState};
use crate::router::Message;
use crate::status::ConnectionState;
use crate::token::{Completion, Token};
use crate::transport::{recv_packet, BoxedStream};
use bytes::BytesMut;
use mqlink_wire::{
    ConnAck, ConnectReturnCode, Packet, PacketDecoder, Publish, QoS, SubAck,
    SubscribeReturnCode, WireError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// First reconnect delay; doubles per failed attempt
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Initial read buffer size
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Poll interval while waiting for in-flight work to settle on disconnect
const QUIESCE_POLL: Duration = Duration::from_millis(10);

/// How long the writer gets to flush DISCONNECT before it is aborted
const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests from the facade to the coordinator
#[derive(Debug)]
pub(crate) enum Command {
    /// Orderly shutdown after waiting up to `quiesce` for in-flight work
    Disconnect {
        quiesce: Duration,
        done: oneshot::Sender<()>,
    },
}

impl Command {
    fn into_done(self) -> oneshot::Sender<()> {
        match self {
            Command::Disconnect { done, .. } => done,
        }
    }
}

/// Reader-to-writer control messages
#[derive(Debug)]
enum Outbound {
    /// Protocol reply (PUBACK, PUBREC, PUBREL, PUBCOMP)
    Packet(Packet),
    /// PINGRESP arrived
    PingResponse,
}

/// How the writer should stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStop {
    /// Send DISCONNECT first
    Disconnect,
    /// Stop immediately
    Abort,
}

/// How a link ended
enum LinkEnd {
    /// Transport or protocol failure
    Lost(ClientError),
    /// Caller asked to disconnect; DISCONNECT has been sent
    Disconnect(oneshot::Sender<()>),
    /// The facade went away
    Closed,
}

/// An established connection before its tasks are spawned
struct Link {
    stream: BoxedStream,
    decoder: PacketDecoder,
    buffer: BytesMut,
    session_present: bool,
}

/// Drive one connect cycle until disconnect or an unrecoverable loss
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connect_token: Token,
) {
    let broker = shared.options.broker.clone();
    let mut connect_token = Some(connect_token);
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;
    let mut reconnecting = false;

    let shutdown: Option<oneshot::Sender<()>> = loop {
        if reconnecting {
            attempt += 1;
            if let Some(callback) = &shared.options.on_reconnecting {
                callback(attempt);
            }
            debug!("Reconnect attempt {} to {}", attempt, broker);
        }

        let established = tokio::select! {
            biased;

            command = commands.recv() => break command.map(Command::into_done),

            result = establish(&shared) => result,
        };

        let link = match established {
            Ok(link) => link,
            Err(cause) => {
                let delay = match &connect_token {
                    Some(token) if !shared.options.connect_retry => {
                        warn!("Connect to {} failed: {}", broker, cause);
                        token.fail(cause);
                        break None;
                    }
                    Some(_) => {
                        warn!(
                            "Connect to {} failed: {}, retrying in {:?}",
                            broker, cause, shared.options.connect_retry_interval
                        );
                        shared.options.connect_retry_interval
                    }
                    None => {
                        warn!(
                            "Reconnect to {} failed: {}, retrying in {:?}",
                            broker, cause, backoff
                        );
                        let delay = backoff;
                        backoff = (backoff * 2).min(shared.options.max_reconnect_interval);
                        delay
                    }
                };

                tokio::select! {
                    biased;

                    command = commands.recv() => break command.map(Command::into_done),

                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        shared.queue.reopen();
        if shared.status.transition(ConnectionState::Connected).is_err() {
            // a disconnect raced the handshake
            break commands.recv().await.map(Command::into_done);
        }

        backoff = INITIAL_BACKOFF;
        attempt = 0;
        info!(
            "Connected to {} (session present: {})",
            broker, link.session_present
        );

        if let Some(token) = connect_token.take() {
            token.complete(Completion::Connected {
                session_present: link.session_present,
            });
        }
        if let Some(callback) = &shared.options.on_connect {
            callback(link.session_present);
        }
        if reconnecting {
            shared.resume_after_reconnect();
        }

        match run_link(&shared, link, &mut commands).await {
            LinkEnd::Disconnect(done) => break Some(done),
            LinkEnd::Closed => break None,
            LinkEnd::Lost(cause) => {
                warn!("Connection to {} lost: {}", broker, cause);
                let next = if shared.options.auto_reconnect {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Disconnecting
                };
                // leave Connected first so no new submit is admitted during the drain
                let left = shared
                    .status
                    .transition_from(ConnectionState::Connected, next);
                shared.abandon_in_flight(ClientError::ConnectionLost);
                if let Some(callback) = &shared.options.on_connection_lost {
                    callback(&cause);
                }

                match left {
                    Ok(()) if next == ConnectionState::Reconnecting => {
                        reconnecting = true;
                        continue;
                    }
                    Err(err) if err.from == ConnectionState::Disconnecting => {
                        break commands.recv().await.map(Command::into_done);
                    }
                    _ => break None,
                }
            }
        }
    };

    shared.abandon_in_flight(ClientError::ConnectionLost);
    if let Some(token) = connect_token {
        token.fail(ClientError::NotConnected);
    }
    if shared.options.clean_session {
        shared.registry.clear();
    } else {
        shared.registry.abandon_deferred();
    }
    shared.clear_commands();
    shared.status.force(ConnectionState::Disconnected);
    info!("Disconnected from {}", broker);

    if let Some(done) = shutdown {
        let _ = done.send(());
    }
}

/// Dial and complete the CONNECT/CONNACK exchange within the connect timeout
async fn establish(shared: &Shared) -> Result<Link, ClientError> {
    let timeout = shared.options.connect_timeout;
    if timeout.is_zero() {
        return handshake(shared).await;
    }

    tokio::time::timeout(timeout, handshake(shared))
        .await
        .unwrap_or_else(|_| {
            Err(ClientError::Transport(format!(
                "connect timed out after {:?}",
                timeout
            )))
        })
}

async fn handshake(shared: &Shared) -> Result<Link, ClientError> {
    let mut stream = shared.dialer.dial().await?;

    let connect = Packet::Connect(shared.options.connect_packet());
    write_packet(&mut stream, &connect).await?;
    debug!(
        "Sent CONNECT to {} (client id: {:?})",
        shared.options.broker, shared.options.client_id
    );

    let mut decoder = PacketDecoder::new();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    match recv_packet(&mut stream, &mut decoder, &mut buffer).await? {
        Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        }) => Ok(Link {
            stream,
            decoder,
            buffer,
            session_present,
        }),
        Packet::ConnAck(ack) => Err(ClientError::Refused(ack.code)),
        other => {
            warn!("Expected CONNACK, received {:?}", other.packet_type());
            Err(ClientError::Codec(WireError::Malformed))
        }
    }
}

/// Run the writer and reader tasks until the link ends
async fn run_link(
    shared: &Arc<Shared>,
    link: Link,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> LinkEnd {
    let Link {
        stream,
        decoder,
        buffer,
        ..
    } = link;
    let (read_half, write_half) = tokio::io::split(stream);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();

    let mut writer = tokio::spawn(writer_loop(shared.clone(), write_half, control_rx, stop_rx));
    let mut reader = tokio::spawn(reader_loop(
        shared.clone(),
        read_half,
        decoder,
        buffer,
        control_tx,
    ));
    let mut writer_done = false;

    let end = tokio::select! {
        biased;

        command = commands.recv() => match command {
            Some(Command::Disconnect { quiesce, done }) => {
                quiesce_in_flight(shared, quiesce, &mut reader).await;
                let _ = stop_tx.send(WriterStop::Disconnect);
                LinkEnd::Disconnect(done)
            }
            None => {
                let _ = stop_tx.send(WriterStop::Abort);
                LinkEnd::Closed
            }
        },

        result = &mut reader => {
            let _ = stop_tx.send(WriterStop::Abort);
            LinkEnd::Lost(result.unwrap_or_else(|e| {
                error!("Reader task failed: {}", e);
                ClientError::Transport(format!("reader task failed: {}", e))
            }))
        }

        result = &mut writer => {
            writer_done = true;
            LinkEnd::Lost(match result {
                Ok(Err(cause)) => cause,
                Ok(Ok(())) => ClientError::ConnectionLost,
                Err(e) => {
                    error!("Writer task failed: {}", e);
                    ClientError::Transport(format!("writer task failed: {}", e))
                }
            })
        }
    };

    reader.abort();
    if !writer_done && tokio::time::timeout(WRITER_STOP_TIMEOUT, &mut writer).await.is_err() {
        warn!("Writer did not stop within {:?}, aborting", WRITER_STOP_TIMEOUT);
        writer.abort();
    }

    end
}

/// Wait until nothing is pending or queued, the deadline passes, or the reader ends
async fn quiesce_in_flight(
    shared: &Shared,
    quiesce: Duration,
    reader: &mut JoinHandle<ClientError>,
) {
    let deadline = Instant::now() + quiesce;
    let settled = async {
        while !(shared.ids.is_empty() && shared.queue.is_empty()) {
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "Quiesce period over with {} operations still pending",
                    shared.ids.len()
                );
                return;
            }
            tokio::time::sleep(QUIESCE_POLL.min(deadline - now)).await;
        }
    };

    tokio::select! {
        _ = settled => {}
        _ = reader => {}
    }
}

async fn write_bytes<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<(), ClientError> {
    let bytes = packet.encode()?;
    write_bytes(writer, &bytes).await?;
    trace!("Wrote {:?} ({} bytes)", packet.packet_type(), bytes.len());
    Ok(())
}

async fn sleep_until(deadline: Option<(Instant, KeepaliveAction)>) {
    match deadline {
        Some((at, _)) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Sole owner of the write half
async fn writer_loop(
    shared: Arc<Shared>,
    mut writer: WriteHalf<BoxedStream>,
    mut control_rx: mpsc::UnboundedReceiver<Outbound>,
    mut stop_rx: oneshot::Receiver<WriterStop>,
) -> Result<(), ClientError> {
    let mut receiver = shared.receiver.lock().await;
    let mut keepalive = KeepaliveState::new(shared.options.keep_alive, shared.options.ping_timeout);

    loop {
        let deadline = keepalive.next_deadline();

        tokio::select! {
            biased;

            stop = &mut stop_rx => {
                if let Ok(WriterStop::Disconnect) = stop {
                    write_packet(&mut writer, &Packet::Disconnect).await?;
                    let _ = writer.shutdown().await;
                    debug!("Sent DISCONNECT to {}", shared.options.broker);
                }
                return Ok(());
            }

            Some(outbound) = control_rx.recv() => match outbound {
                Outbound::Packet(packet) => {
                    write_packet(&mut writer, &packet).await?;
                    keepalive.record_sent();
                    debug!("Sent {:?} (id: {:?})", packet.packet_type(), packet.packet_id());
                }
                Outbound::PingResponse => {
                    if let Some(rtt) = keepalive.record_pong() {
                        trace!("PINGRESP after {:?}", rtt);
                    }
                }
            },

            item = receiver.recv() => match item {
                Some(item) => write_item(&shared, &mut writer, item, &mut keepalive).await?,
                None => return Ok(()),
            },

            _ = sleep_until(deadline) => match deadline.map(|(_, action)| action) {
                Some(KeepaliveAction::Ping) => {
                    write_packet(&mut writer, &Packet::PingReq).await?;
                    keepalive.record_ping();
                    debug!("Sent PINGREQ to {}", shared.options.broker);
                }
                Some(KeepaliveAction::TimedOut) => {
                    warn!(
                        "No PINGRESP from {} within {:?}",
                        shared.options.broker, shared.options.ping_timeout
                    );
                    return Err(ClientError::ConnectionLost);
                }
                None => {}
            },
        }
    }
}

async fn write_item(
    shared: &Shared,
    writer: &mut WriteHalf<BoxedStream>,
    item: QueuedWrite,
    keepalive: &mut KeepaliveState,
) -> Result<(), ClientError> {
    if item.token.is_complete() {
        debug!("Skipping write for an operation that already completed");
        return Ok(());
    }
    if item.is_expired() {
        debug!("Dropping write that outlived its deadline (id: {:?})", item.id);
        shared.abandon(
            item.id,
            &item.token,
            ClientError::DispatchTimeout(shared.options.write_timeout),
        );
        return Ok(());
    }

    if let Err(err) = write_bytes(writer, &item.bytes).await {
        item.token.fail(ClientError::ConnectionLost);
        return Err(err.into());
    }

    keepalive.record_sent();
    trace!("Wrote {} bytes (id: {:?})", item.bytes.len(), item.id);
    if let Some(completion) = item.on_write {
        item.token.complete(completion);
    }
    Ok(())
}

/// Sole owner of the read half; returns why reading stopped
async fn reader_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<BoxedStream>,
    mut decoder: PacketDecoder,
    mut buffer: BytesMut,
    control_tx: mpsc::UnboundedSender<Outbound>,
) -> ClientError {
    // QoS 2 deliveries awaiting PUBREL
    let mut inbound_qos2: HashSet<u16> = HashSet::new();

    loop {
        let packet = match recv_packet(&mut reader, &mut decoder, &mut buffer).await {
            Ok(packet) => packet,
            Err(cause) => return cause,
        };
        trace!("Received {:?}", packet.packet_type());

        match packet {
            Packet::Publish(publish) => {
                handle_publish(&shared, publish, &mut inbound_qos2, &control_tx);
            }

            Packet::PubAck(id) => {
                if let Some(op) = shared.ids.take_if(id, |kind| {
                    matches!(kind, PendingKind::Publish(QoS::AtLeastOnce))
                }) {
                    debug!("Received PUBACK (id: {})", id);
                    op.token.complete(Completion::Published);
                }
            }

            Packet::PubRec(id) => {
                if !shared.ids.is_pending(id) {
                    debug!("PUBREC for unknown message id {}", id);
                }
                let _ = control_tx.send(Outbound::Packet(Packet::PubRel(id)));
            }

            Packet::PubComp(id) => {
                if let Some(op) = shared.ids.take_if(id, |kind| {
                    matches!(kind, PendingKind::Publish(QoS::ExactlyOnce))
                }) {
                    debug!("Received PUBCOMP (id: {})", id);
                    op.token.complete(Completion::Published);
                }
            }

            Packet::PubRel(id) => {
                inbound_qos2.remove(&id);
                let _ = control_tx.send(Outbound::Packet(Packet::PubComp(id)));
            }

            Packet::SubAck(suback) => handle_suback(&shared, suback),

            Packet::UnsubAck(id) => {
                let Some(op) = shared
                    .ids
                    .take_if(id, |kind| matches!(kind, PendingKind::Unsubscribe(_)))
                else {
                    continue;
                };
                if let PendingKind::Unsubscribe(filters) = &op.kind {
                    for filter in filters {
                        shared.registry.remove(filter);
                        shared.router.remove_route(filter);
                    }
                }
                debug!("Received UNSUBACK (id: {})", id);
                op.token.complete(Completion::Unsubscribed);
            }

            Packet::PingResp => {
                let _ = control_tx.send(Outbound::PingResponse);
            }

            other => {
                warn!("Ignoring unexpected {:?} from broker", other.packet_type());
            }
        }
    }
}

fn handle_publish(
    shared: &Arc<Shared>,
    publish: Publish,
    inbound_qos2: &mut HashSet<u16>,
    control_tx: &mpsc::UnboundedSender<Outbound>,
) {
    let id = publish.packet_id;
    match (publish.qos, id) {
        (QoS::AtMostOnce, _) => deliver(shared, Message::from(publish)),
        (QoS::AtLeastOnce, Some(id)) => {
            deliver(shared, Message::from(publish));
            let _ = control_tx.send(Outbound::Packet(Packet::PubAck(id)));
        }
        (QoS::ExactlyOnce, Some(id)) => {
            if inbound_qos2.insert(id) {
                deliver(shared, Message::from(publish));
            } else {
                debug!("Suppressed duplicate QoS 2 delivery (id: {})", id);
            }
            let _ = control_tx.send(Outbound::Packet(Packet::PubRec(id)));
        }
        (qos, None) => warn!("PUBLISH at QoS {} without a message id", qos),
    }
}

fn deliver(shared: &Arc<Shared>, message: Message) {
    if shared.options.order_matters {
        shared.router.route(message);
    } else {
        let router = shared.router.clone();
        tokio::spawn(async move {
            router.route(message);
        });
    }
}

fn handle_suback(shared: &Shared, suback: SubAck) {
    let id = suback.packet_id;
    let Some(op) = shared
        .ids
        .take_if(id, |kind| matches!(kind, PendingKind::Subscribe(_)))
    else {
        return;
    };
    let PendingKind::Subscribe(records) = op.kind else {
        return;
    };

    if records.len() != suback.return_codes.len() {
        warn!(
            "SUBACK (id: {}) carries {} codes for {} filters",
            id,
            suback.return_codes.len(),
            records.len()
        );
        op.token.fail(ClientError::Codec(WireError::Malformed));
        return;
    }

    let mut granted = Vec::with_capacity(records.len());
    for code in &suback.return_codes {
        match code {
            SubscribeReturnCode::Success(qos) => granted.push(*qos),
            SubscribeReturnCode::Failure => {
                warn!("Broker refused subscription (id: {})", id);
                op.token.fail(ClientError::ProtocolNack(code.code()));
                return;
            }
        }
    }

    // Registry first so the subscription is on record when the caller wakes.
    for record in records {
        match &record.handler {
            Some(handler) => shared.router.add_route(&record.filter, handler.clone()),
            None => {
                shared.router.remove_route(&record.filter);
            }
        }
        shared.registry.record(record);
    }
    debug!("Received SUBACK (id: {}, granted: {:?})", id, granted);
    op.token.complete(Completion::Subscribed { granted });
}
