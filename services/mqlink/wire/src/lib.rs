//! MQTT 3.1.1 control packet encoding and decoding for mqlink.
//!
//! This crate provides the low-level wire protocol used by the mqlink client
//! engine: fixed header processing, control packet bodies, incremental stream
//! decoding, and the topic name/filter grammar.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 type | flags      | packet type (4) + flags (4)|
//! +----------------------+----------------------------+
//! | remaining length     | variable byte integer (1-4)|
//! +----------------------+----------------------------+
//! | variable header      | packet specific            |
//! +----------------------+----------------------------+
//! | payload              | packet specific            |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod decoder;
pub mod error;
pub mod header;
pub mod packet;
pub mod topic;

// Re-export main types
pub use decoder::{PacketDecoder, DEFAULT_MAX_PACKET_SIZE};
pub use error::WireError;
pub use header::{
    encode_remaining_length, ConnectFlags, FixedHeader, PacketType, QoS, MAX_REMAINING_LENGTH,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};
pub use packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, Publish, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe,
};
pub use topic::{topic_matches, validate_topic_filter, validate_topic_name, MAX_TOPIC_LEN};
