//! Fixed header processing for the wire protocol.
//!
//! Every MQTT control packet starts with a fixed header: one byte holding the
//! packet type and its flags, followed by the "remaining length" encoded as a
//! variable byte integer of one to four bytes.

use crate::WireError;
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol name carried in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;

/// Largest value the remaining length field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Control packet types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Client request to connect
    Connect = 1,
    /// Connect acknowledgment
    ConnAck = 2,
    /// Publish message
    Publish = 3,
    /// Publish acknowledgment (QoS 1)
    PubAck = 4,
    /// Publish received (QoS 2, part 1)
    PubRec = 5,
    /// Publish release (QoS 2, part 2)
    PubRel = 6,
    /// Publish complete (QoS 2, part 3)
    PubComp = 7,
    /// Subscribe request
    Subscribe = 8,
    /// Subscribe acknowledgment
    SubAck = 9,
    /// Unsubscribe request
    Unsubscribe = 10,
    /// Unsubscribe acknowledgment
    UnsubAck = 11,
    /// Ping request
    PingReq = 12,
    /// Ping response
    PingResp = 13,
    /// Client is disconnecting
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(WireError::Type(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags mandated for every type except PUBLISH
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0b0010),
            _ => Some(0),
        }
    }
}

/// Quality of service levels
///
/// Serializes as its numeric level so JSON output reads `"qos": 1`.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery
    AtLeastOnce = 1,
    /// Assured single delivery
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(WireError::Qos(value)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

bitflags! {
    /// CONNECT flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectFlags: u8 {
        /// Discard any previous session state
        const CLEAN_SESSION = 1 << 1;
        /// A will message is present
        const WILL = 1 << 2;
        /// Low bit of the will QoS
        const WILL_QOS_LOW = 1 << 3;
        /// High bit of the will QoS
        const WILL_QOS_HIGH = 1 << 4;
        /// Will message is retained
        const WILL_RETAIN = 1 << 5;
        /// Password field is present
        const PASSWORD = 1 << 6;
        /// User name field is present
        const USERNAME = 1 << 7;
    }
}

impl ConnectFlags {
    /// Set the two will QoS bits
    pub fn with_will_qos(mut self, qos: QoS) -> Self {
        self.remove(ConnectFlags::WILL_QOS_LOW | ConnectFlags::WILL_QOS_HIGH);
        self |= ConnectFlags::from_bits_retain((qos as u8) << 3);
        self
    }

    /// Read the two will QoS bits
    pub fn will_qos(self) -> Result<QoS, WireError> {
        QoS::try_from((self.bits() >> 3) & 0b11)
    }
}

/// Fixed header of a control packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type (high nibble of the first byte)
    pub typ: PacketType,
    /// Type-specific flags (low nibble of the first byte)
    pub flags: u8,
    /// Number of bytes following the fixed header
    pub remaining_len: usize,
}

impl FixedHeader {
    /// Create a fixed header
    pub fn new(typ: PacketType, flags: u8, remaining_len: usize) -> Self {
        Self {
            typ,
            flags: flags & 0x0F,
            remaining_len,
        }
    }

    /// Encode the fixed header
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        buf.put_u8(((self.typ as u8) << 4) | self.flags);
        encode_remaining_length(self.remaining_len, buf)
    }

    /// Parse a fixed header from the start of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, otherwise the header and
    /// the number of bytes it occupies.
    pub fn parse(buf: &[u8]) -> Result<Option<(FixedHeader, usize)>, WireError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        let typ = PacketType::try_from(first >> 4)?;
        let flags = first & 0x0F;
        if let Some(required) = typ.required_flags() {
            if flags != required {
                return Err(WireError::Flags(flags));
            }
        }

        match decode_remaining_length(&buf[1..])? {
            Some((remaining_len, len_bytes)) => Ok(Some((
                FixedHeader {
                    typ,
                    flags,
                    remaining_len,
                },
                1 + len_bytes,
            ))),
            None => Ok(None),
        }
    }
}

/// Encode a remaining length as a variable byte integer
pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) -> Result<(), WireError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(WireError::Size(len));
    }

    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Decode a variable byte integer, returning the value and bytes consumed
fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(WireError::RemainingLength);
        }
        value += (*byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(WireError::RemainingLength);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_serializes_as_level() {
        assert_eq!(serde_json::to_string(&QoS::ExactlyOnce).unwrap(), "2");
        assert_eq!(serde_json::from_str::<QoS>("1").unwrap(), QoS::AtLeastOnce);
        assert!(serde_json::from_str::<QoS>("3").is_err());
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(3).unwrap(), PacketType::Publish);
        assert_eq!(PacketType::try_from(14).unwrap(), PacketType::Disconnect);
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::try_from(15).is_err());
    }

    #[test]
    fn test_qos_conversion() {
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert_eq!(QoS::try_from(3), Err(WireError::Qos(3)));
    }

    #[test]
    fn test_remaining_length_boundaries() {
        for (len, expected) in [(0, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (2_097_152, 4)] {
            let mut buf = BytesMut::new();
            encode_remaining_length(len, &mut buf).unwrap();
            assert_eq!(buf.len(), expected, "length {}", len);
            assert_eq!(decode_remaining_length(&buf).unwrap(), Some((len, expected)));
        }

        let mut buf = BytesMut::new();
        assert!(encode_remaining_length(MAX_REMAINING_LENGTH + 1, &mut buf).is_err());
    }

    #[test]
    fn test_remaining_length_partial_and_overlong() {
        assert_eq!(decode_remaining_length(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(
            decode_remaining_length(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(WireError::RemainingLength)
        );
    }

    #[test]
    fn test_fixed_header_flag_validation() {
        // SUBSCRIBE must carry 0b0010
        assert_eq!(FixedHeader::parse(&[0x80, 0x00]), Err(WireError::Flags(0)));
        let (header, used) = FixedHeader::parse(&[0x82, 0x05]).unwrap().unwrap();
        assert_eq!(header.typ, PacketType::Subscribe);
        assert_eq!(header.remaining_len, 5);
        assert_eq!(used, 2);
    }

    #[test]
    fn test_will_qos_bits() {
        let flags = ConnectFlags::WILL.with_will_qos(QoS::ExactlyOnce);
        assert!(flags.contains(ConnectFlags::WILL_QOS_HIGH));
        assert!(!flags.contains(ConnectFlags::WILL_QOS_LOW));
        assert_eq!(flags.will_qos().unwrap(), QoS::ExactlyOnce);
    }
}
