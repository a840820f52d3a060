//! MQTT 5.0 protocol encoding and decoding.
//!
//! Decoding is pure: every function takes a byte slice and returns a typed
//! value or a [`ProtocolError`](crate::error::ProtocolError) carrying the
//! reason code to report.

pub mod ack;
pub mod codec;
pub mod connect;
pub mod framer;
pub mod packet;
pub mod properties;
pub mod publish;
pub mod subscribe;

pub use ack::{Auth, Disconnect, PubAck};
pub use connect::{ConnAck, Connect, Will};
pub use framer::Framer;
pub use packet::{FixedHeader, Packet, PacketType, read_fixed_header};
pub use properties::{Properties, PropertyId};
pub use publish::Publish;
pub use subscribe::{SubAck, Subscribe, UnsubAck, Unsubscribe};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 5.0.
pub const PROTOCOL_VERSION: u8 = 5;
