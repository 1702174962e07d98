//! Control packet definitions with their body encoding and decoding.

use crate::header::{ConnectFlags, FixedHeader, PacketType, QoS, PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Last will and testament registered with CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic the will is published to
    pub topic: String,
    /// Will payload
    pub payload: Bytes,
    /// Will QoS
    pub qos: QoS,
    /// Whether the will is retained
    pub retain: bool,
}

/// CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Client identifier
    pub client_id: String,
    /// Start a clean session
    pub clean_session: bool,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    /// Optional user name
    pub username: Option<String>,
    /// Optional password
    pub password: Option<Bytes>,
    /// Optional will message
    pub will: Option<LastWill>,
}

/// CONNACK return codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    /// Connection accepted
    Accepted = 0,
    /// Unacceptable protocol version
    UnacceptableProtocolVersion = 1,
    /// Client identifier rejected
    IdentifierRejected = 2,
    /// Server unavailable
    ServerUnavailable = 3,
    /// Bad user name or password
    BadUsernameOrPassword = 4,
    /// Not authorized
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUsernameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(WireError::Code(value)),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "connection accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUsernameOrPassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// CONNACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Broker resumed a stored session
    pub session_present: bool,
    /// Connection result
    pub code: ConnectReturnCode,
}

/// PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Topic name
    pub topic: String,
    /// Delivery QoS
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Duplicate delivery flag
    pub dup: bool,
    /// Packet identifier, present when QoS > 0
    pub packet_id: Option<u16>,
    /// Application payload
    pub payload: Bytes,
}

/// Per-filter result in a SUBACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    /// Subscription accepted with the granted QoS
    Success(QoS),
    /// Subscription refused (0x80)
    Failure,
}

impl SubscribeReturnCode {
    /// Raw code as carried on the wire
    pub fn code(self) -> u8 {
        match self {
            SubscribeReturnCode::Success(qos) => qos as u8,
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters with their requested QoS
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    /// Packet identifier
    pub packet_id: u16,
    /// One return code per requested filter
    pub return_codes: Vec<SubscribeReturnCode>,
}

/// UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Packet identifier
    pub packet_id: u16,
    /// Topic filters to remove
    pub filters: Vec<String>,
}

/// MQTT 3.1.1 control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT
    Connect(Connect),
    /// CONNACK
    ConnAck(ConnAck),
    /// PUBLISH
    Publish(Publish),
    /// PUBACK
    PubAck(u16),
    /// PUBREC
    PubRec(u16),
    /// PUBREL
    PubRel(u16),
    /// PUBCOMP
    PubComp(u16),
    /// SUBSCRIBE
    Subscribe(Subscribe),
    /// SUBACK
    SubAck(SubAck),
    /// UNSUBSCRIBE
    Unsubscribe(Unsubscribe),
    /// UNSUBACK
    UnsubAck(u16),
    /// PINGREQ
    PingReq,
    /// PINGRESP
    PingResp,
    /// DISCONNECT
    Disconnect,
}

impl Packet {
    /// Control packet type
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Packet identifier, if the packet carries one
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            Packet::Publish(publish) => publish.packet_id,
            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => Some(*id),
            Packet::Subscribe(subscribe) => Some(subscribe.packet_id),
            Packet::SubAck(suback) => Some(suback.packet_id),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            _ => None,
        }
    }

    fn header_flags(&self) -> u8 {
        match self {
            Packet::Publish(publish) => {
                ((publish.dup as u8) << 3) | ((publish.qos as u8) << 1) | publish.retain as u8
            }
            other => other.packet_type().required_flags().unwrap_or(0),
        }
    }

    /// Encode the packet, fixed header included
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;

        let header = FixedHeader::new(self.packet_type(), self.header_flags(), body.len());
        let mut buf = BytesMut::with_capacity(body.len() + 5);
        header.encode(&mut buf)?;
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Packet::Connect(connect) => {
                write_str(buf, PROTOCOL_NAME)?;
                buf.put_u8(PROTOCOL_LEVEL);

                let mut flags = ConnectFlags::empty();
                if connect.clean_session {
                    flags |= ConnectFlags::CLEAN_SESSION;
                }
                if let Some(will) = &connect.will {
                    flags |= ConnectFlags::WILL;
                    flags = flags.with_will_qos(will.qos);
                    if will.retain {
                        flags |= ConnectFlags::WILL_RETAIN;
                    }
                }
                if connect.username.is_some() {
                    flags |= ConnectFlags::USERNAME;
                }
                if connect.password.is_some() {
                    flags |= ConnectFlags::PASSWORD;
                }
                buf.put_u8(flags.bits());
                buf.put_u16(connect.keep_alive);

                write_str(buf, &connect.client_id)?;
                if let Some(will) = &connect.will {
                    write_str(buf, &will.topic)?;
                    write_binary(buf, &will.payload)?;
                }
                if let Some(username) = &connect.username {
                    write_str(buf, username)?;
                }
                if let Some(password) = &connect.password {
                    write_binary(buf, password)?;
                }
            }

            Packet::ConnAck(connack) => {
                buf.put_u8(connack.session_present as u8);
                buf.put_u8(connack.code as u8);
            }

            Packet::Publish(publish) => {
                write_str(buf, &publish.topic)?;
                match (publish.qos, publish.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (_, Some(id)) if id != 0 => buf.put_u16(id),
                    _ => return Err(WireError::Malformed),
                }
                buf.put_slice(&publish.payload);
            }

            Packet::PubAck(id)
            | Packet::PubRec(id)
            | Packet::PubRel(id)
            | Packet::PubComp(id)
            | Packet::UnsubAck(id) => buf.put_u16(*id),

            Packet::Subscribe(subscribe) => {
                if subscribe.filters.is_empty() {
                    return Err(WireError::Malformed);
                }
                buf.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    write_str(buf, filter)?;
                    buf.put_u8(*qos as u8);
                }
            }

            Packet::SubAck(suback) => {
                buf.put_u16(suback.packet_id);
                for code in &suback.return_codes {
                    buf.put_u8(code.code());
                }
            }

            Packet::Unsubscribe(unsubscribe) => {
                if unsubscribe.filters.is_empty() {
                    return Err(WireError::Malformed);
                }
                buf.put_u16(unsubscribe.packet_id);
                for filter in &unsubscribe.filters {
                    write_str(buf, filter)?;
                }
            }

            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }

        Ok(())
    }

    /// Decode a packet body whose fixed header has already been parsed
    pub fn decode_body(header: FixedHeader, mut body: Bytes) -> Result<Packet, WireError> {
        let packet = match header.typ {
            PacketType::Connect => {
                let name = read_str(&mut body)?;
                let level = read_u8(&mut body)?;
                if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
                    return Err(WireError::Malformed);
                }

                let flags = ConnectFlags::from_bits(read_u8(&mut body)?).ok_or(WireError::Malformed)?;
                let keep_alive = read_u16(&mut body)?;
                let client_id = read_str(&mut body)?;

                let will = if flags.contains(ConnectFlags::WILL) {
                    Some(LastWill {
                        topic: read_str(&mut body)?,
                        payload: read_binary(&mut body)?,
                        qos: flags.will_qos()?,
                        retain: flags.contains(ConnectFlags::WILL_RETAIN),
                    })
                } else {
                    None
                };
                let username = if flags.contains(ConnectFlags::USERNAME) {
                    Some(read_str(&mut body)?)
                } else {
                    None
                };
                let password = if flags.contains(ConnectFlags::PASSWORD) {
                    Some(read_binary(&mut body)?)
                } else {
                    None
                };

                Packet::Connect(Connect {
                    client_id,
                    clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
                    keep_alive,
                    username,
                    password,
                    will,
                })
            }

            PacketType::ConnAck => {
                let ack_flags = read_u8(&mut body)?;
                if ack_flags & !0x01 != 0 {
                    return Err(WireError::Malformed);
                }
                let code = ConnectReturnCode::try_from(read_u8(&mut body)?)?;
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 == 1,
                    code,
                })
            }

            PacketType::Publish => {
                let qos = QoS::try_from((header.flags >> 1) & 0b11)?;
                let topic = read_str(&mut body)?;
                let packet_id = match qos {
                    QoS::AtMostOnce => None,
                    _ => match read_u16(&mut body)? {
                        0 => return Err(WireError::Malformed),
                        id => Some(id),
                    },
                };
                Packet::Publish(Publish {
                    topic,
                    qos,
                    retain: header.flags & 0x01 == 1,
                    dup: header.flags & 0x08 != 0,
                    packet_id,
                    payload: body.split_off(0),
                })
            }

            PacketType::PubAck => Packet::PubAck(read_u16(&mut body)?),
            PacketType::PubRec => Packet::PubRec(read_u16(&mut body)?),
            PacketType::PubRel => Packet::PubRel(read_u16(&mut body)?),
            PacketType::PubComp => Packet::PubComp(read_u16(&mut body)?),
            PacketType::UnsubAck => Packet::UnsubAck(read_u16(&mut body)?),

            PacketType::Subscribe => {
                let packet_id = read_u16(&mut body)?;
                let mut filters = Vec::new();
                while body.has_remaining() {
                    let filter = read_str(&mut body)?;
                    let requested = read_u8(&mut body)?;
                    if requested & !0b11 != 0 {
                        return Err(WireError::Malformed);
                    }
                    filters.push((filter, QoS::try_from(requested)?));
                }
                if filters.is_empty() {
                    return Err(WireError::Malformed);
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }

            PacketType::SubAck => {
                let packet_id = read_u16(&mut body)?;
                let mut return_codes = Vec::with_capacity(body.remaining());
                while body.has_remaining() {
                    let code = match body.get_u8() {
                        0x80 => SubscribeReturnCode::Failure,
                        raw => SubscribeReturnCode::Success(
                            QoS::try_from(raw).map_err(|_| WireError::Malformed)?,
                        ),
                    };
                    return_codes.push(code);
                }
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                })
            }

            PacketType::Unsubscribe => {
                let packet_id = read_u16(&mut body)?;
                let mut filters = Vec::new();
                while body.has_remaining() {
                    filters.push(read_str(&mut body)?);
                }
                if filters.is_empty() {
                    return Err(WireError::Malformed);
                }
                Packet::Unsubscribe(Unsubscribe { packet_id, filters })
            }

            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
        };

        if body.has_remaining() {
            return Err(WireError::Malformed);
        }

        Ok(packet)
    }
}

fn write_str(buf: &mut BytesMut, value: &str) -> Result<(), WireError> {
    write_binary(buf, value.as_bytes())
}

fn write_binary(buf: &mut BytesMut, value: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::Size(value.len()))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn read_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Malformed);
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Malformed);
    }
    Ok(buf.get_u16())
}

fn read_binary(buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Malformed);
    }
    Ok(buf.split_to(len))
}

fn read_str(buf: &mut Bytes) -> Result<String, WireError> {
    let raw = read_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
}
