//! In-memory broker harness for engine tests.

use crate::transport::{BoxedStream, Dialer};
use async_trait::async_trait;
use bytes::BytesMut;
use mqlink_wire::{ConnAck, Connect, ConnectReturnCode, Packet, PacketDecoder};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

const PIPE_CAPACITY: usize = 64 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Dialer handing the broker half of each new pipe to the test
pub(crate) struct DuplexDialer {
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

impl DuplexDialer {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        (Arc::new(Self { accepted }), incoming)
    }
}

#[async_trait]
impl Dialer for DuplexDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.accepted
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "broker gone"))?;
        Ok(Box::new(client))
    }
}

/// Broker side of one client connection
pub(crate) struct BrokerConn {
    stream: DuplexStream,
    decoder: PacketDecoder,
    buffer: BytesMut,
}

impl BrokerConn {
    /// Wait for the client to dial
    pub(crate) async fn accept(incoming: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Self {
        let stream = tokio::time::timeout(RECV_TIMEOUT, incoming.recv())
            .await
            .expect("client never dialed")
            .expect("dialer dropped");
        Self {
            stream,
            decoder: PacketDecoder::new(),
            buffer: BytesMut::new(),
        }
    }

    /// Accept a connection and answer its CONNECT
    pub(crate) async fn handshake(
        incoming: &mut mpsc::UnboundedReceiver<DuplexStream>,
        session_present: bool,
    ) -> (Self, Connect) {
        let mut conn = Self::accept(incoming).await;
        let connect = match conn.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {:?}", other),
        };
        conn.send(Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        }))
        .await;
        (conn, connect)
    }

    /// Next packet from the client
    pub(crate) async fn recv(&mut self) -> Packet {
        self.try_recv(RECV_TIMEOUT)
            .await
            .expect("no packet from client")
    }

    /// Next packet from the client, or `None` after `timeout` or on EOF
    pub(crate) async fn try_recv(&mut self, timeout: Duration) -> Option<Packet> {
        let read = crate::transport::recv_packet(&mut self.stream, &mut self.decoder, &mut self.buffer);
        match tokio::time::timeout(timeout, read).await {
            Ok(Ok(packet)) => Some(packet),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Write a packet to the client
    pub(crate) async fn send(&mut self, packet: Packet) {
        let bytes = packet.encode().expect("encodable packet");
        self.stream.write_all(&bytes).await.expect("client gone");
    }
}
