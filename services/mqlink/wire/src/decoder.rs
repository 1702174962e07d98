//! Incremental packet decoding from a byte stream.

use crate::header::FixedHeader;
use crate::packet::Packet;
use crate::WireError;
use bytes::{Buf, BytesMut};
use tracing::trace;

/// Default maximum accepted packet size (16 MiB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Packet decoder
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    max_packet_size: usize,
}

impl PacketDecoder {
    /// Create a new packet decoder
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Create a decoder with a custom size limit
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Decode one packet from a buffer.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the packet is not
    /// complete yet. On success the packet's bytes are consumed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, WireError> {
        let Some((header, header_len)) = FixedHeader::parse(buf)? else {
            return Ok(None);
        };

        if header.remaining_len > self.max_packet_size {
            return Err(WireError::Size(header.remaining_len));
        }

        if buf.len() < header_len + header.remaining_len {
            return Ok(None);
        }

        buf.advance(header_len);
        let body = buf.split_to(header.remaining_len).freeze();
        let packet = Packet::decode_body(header, body)?;
        trace!("Decoded {:?} ({} bytes)", header.typ, header_len + header.remaining_len);

        Ok(Some(packet))
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::QoS;
    use crate::packet::Publish;
    use bytes::Bytes;

    #[test]
    fn test_decode_split_across_reads() {
        let packet = Packet::Publish(Publish {
            topic: "metrics/cpu".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            packet_id: Some(42),
            payload: Bytes::from(vec![7u8; 300]),
        });
        let bytes = packet.encode().unwrap();

        let mut decoder = PacketDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[1..100]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 100);
        buf.extend_from_slice(&bytes[100..]);

        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Packet::PubAck(1).encode().unwrap());
        buf.extend_from_slice(&Packet::PingResp.encode().unwrap());

        let mut decoder = PacketDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Packet::PubAck(1)));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_size_limit() {
        let mut decoder = PacketDecoder::with_max_packet_size(10);
        let mut buf = BytesMut::from(&[0x30u8, 0x20][..]);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Size(32)));
    }
}
