//! Byte stream transport for client sessions.
//!
//! The engine only needs an already-connected duplex byte stream; a
//! [`Dialer`] produces one per connection attempt.

use crate::error::ClientError;
use async_trait::async_trait;
use bytes::BytesMut;
use mqlink_wire::{Packet, PacketDecoder};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Duplex byte stream usable by the engine
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed transport stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens transport connections to the broker
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new connection
    async fn dial(&self) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    /// Dial `addr` (`host:port`)
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Target address
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = connect_tcp(&self.addr).await?;
        Ok(Box::new(stream))
    }
}

/// Connect to a TCP address with Nagle disabled
pub async fn connect_tcp(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    debug!("TCP connection established to {}", addr);
    Ok(stream)
}

/// Read the next packet, buffering partial input in `buffer`
pub async fn recv_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut PacketDecoder,
    buffer: &mut BytesMut,
) -> Result<Packet, ClientError> {
    loop {
        if let Some(packet) = decoder.decode(buffer)? {
            return Ok(packet);
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            return Err(ClientError::ConnectionLost);
        }

        trace!(
            "Read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_recv_packet_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bytes = Packet::PubAck(5).encode().unwrap();

        let writer = tokio::spawn(async move {
            server.write_all(&bytes[..1]).await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(&bytes[1..]).await.unwrap();
            server.write_all(&Packet::PingResp.encode().unwrap()).await.unwrap();
            server
        });

        let mut decoder = PacketDecoder::new();
        let mut buffer = BytesMut::new();
        assert_eq!(
            recv_packet(&mut client, &mut decoder, &mut buffer).await.unwrap(),
            Packet::PubAck(5)
        );
        assert_eq!(
            recv_packet(&mut client, &mut decoder, &mut buffer).await.unwrap(),
            Packet::PingResp
        );

        drop(writer.await.unwrap());
        assert_eq!(
            recv_packet(&mut client, &mut decoder, &mut buffer).await,
            Err(ClientError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn test_tcp_dialer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let dialer = TcpDialer::new(addr);
        assert!(dialer.dial().await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
