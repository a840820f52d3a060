//! MQTT 5.0 control packets and fixed-header handling.

use bytes::{BufMut, Bytes, BytesMut};

use super::ack::{Auth, Disconnect, PubAck};
use super::codec::{Reader, read_variable_int, variable_int_len, write_variable_int};
use super::connect::{ConnAck, Connect};
use super::publish::Publish;
use super::subscribe::{SubAck, Subscribe, UnsubAck, Unsubscribe};
use crate::error::ProtocolError;
use crate::types::ReasonCode;

/// MQTT packet type (upper nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            4 => Some(PacketType::PubAck),
            5 => Some(PacketType::PubRec),
            6 => Some(PacketType::PubRel),
            7 => Some(PacketType::PubComp),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            10 => Some(PacketType::Unsubscribe),
            11 => Some(PacketType::UnsubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            14 => Some(PacketType::Disconnect),
            15 => Some(PacketType::Auth),
            _ => None,
        }
    }

    /// Flag nibble every packet type except PUBLISH must carry.
    fn required_flags(self) -> u8 {
        match self {
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0,
        }
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: u32,
    /// Length of the fixed header itself (type byte plus length bytes).
    pub header_length: usize,
}

impl FixedHeader {
    /// Total frame length, header included.
    pub fn frame_length(&self) -> usize {
        self.header_length + self.remaining_length as usize
    }
}

/// Read a fixed header from the front of `buf`.
///
/// Returns `Ok(None)` while the remaining-length field is still incomplete.
pub fn read_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let packet_type = PacketType::from_u8(first >> 4)
        .ok_or_else(|| ProtocolError::malformed(format!("invalid packet type {}", first >> 4)))?;
    let flags = first & 0x0F;
    if packet_type != PacketType::Publish && flags != packet_type.required_flags() {
        return Err(ProtocolError::malformed(format!(
            "{:?}: invalid fixed header flags {:#06b}",
            packet_type, flags
        )));
    }

    let Some((remaining_length, len)) = read_variable_int(&buf[1..])? else {
        return Ok(None);
    };

    Ok(Some(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + len,
    }))
}

/// MQTT 5.0 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubAck),
    PubRel(PubAck),
    PubComp(PubAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
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
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Parse one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame, otherwise
    /// the packet and the number of bytes it occupied.
    pub fn read(buf: &[u8], max_size: usize) -> Result<Option<(Packet, usize)>, ProtocolError> {
        let Some(header) = read_fixed_header(buf)? else {
            return Ok(None);
        };
        let total_len = header.frame_length();
        if total_len > max_size {
            return Err(ProtocolError::new(
                ReasonCode::PACKET_TOO_LARGE,
                format!("packet of {} bytes exceeds maximum {}", total_len, max_size),
            ));
        }
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[header.header_length..total_len];
        let packet = Self::decode_body(header, body)?;
        Ok(Some((packet, total_len)))
    }

    /// Decode exactly one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError> {
        let header = read_fixed_header(frame)?
            .ok_or_else(|| ProtocolError::malformed("truncated fixed header"))?;
        if frame.len() != header.frame_length() {
            return Err(ProtocolError::malformed(format!(
                "frame length {} does not match remaining length {}",
                frame.len(),
                header.remaining_length
            )));
        }
        Self::decode_body(header, &frame[header.header_length..])
    }

    fn decode_body(header: FixedHeader, body: &[u8]) -> Result<Packet, ProtocolError> {
        let mut r = Reader::new(body);
        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(Connect::read(&mut r)?),
            PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut r)?),
            PacketType::Publish => Packet::Publish(Publish::read(header.flags, &mut r)?),
            PacketType::PubAck => Packet::PubAck(PubAck::read(&mut r)?),
            PacketType::PubRec => Packet::PubRec(PubAck::read(&mut r)?),
            PacketType::PubRel => Packet::PubRel(PubAck::read(&mut r)?),
            PacketType::PubComp => Packet::PubComp(PubAck::read(&mut r)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut r)?),
            PacketType::SubAck => Packet::SubAck(SubAck::read(&mut r)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(&mut r)?),
            PacketType::UnsubAck => Packet::UnsubAck(UnsubAck::read(&mut r)?),
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect(Disconnect::read(&mut r)?),
            PacketType::Auth => Packet::Auth(Auth::read(&mut r)?),
        };

        if !r.is_empty() {
            return Err(ProtocolError::malformed(format!(
                "{:?}: {} trailing bytes",
                header.packet_type,
                r.remaining()
            )));
        }
        Ok(packet)
    }

    fn flags(&self) -> u8 {
        match self {
            Packet::Publish(p) => p.flags(),
            other => other.packet_type().required_flags(),
        }
    }

    /// Append the encoded packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        match self {
            Packet::Connect(p) => p.write(&mut body)?,
            Packet::ConnAck(p) => p.write(&mut body)?,
            Packet::Publish(p) => p.write(&mut body)?,
            Packet::PubAck(p) | Packet::PubRec(p) | Packet::PubRel(p) | Packet::PubComp(p) => {
                p.write(&mut body)?
            }
            Packet::Subscribe(p) => p.write(&mut body)?,
            Packet::SubAck(p) => p.write(&mut body)?,
            Packet::Unsubscribe(p) => p.write(&mut body)?,
            Packet::UnsubAck(p) => p.write(&mut body)?,
            Packet::PingReq | Packet::PingResp => {}
            Packet::Disconnect(p) => p.write(&mut body)?,
            Packet::Auth(p) => p.write(&mut body)?,
        }

        let remaining = u32::try_from(body.len())
            .map_err(|_| ProtocolError::malformed("packet body too large"))?;
        buf.reserve(1 + variable_int_len(remaining) + body.len());
        buf.put_u8(((self.packet_type() as u8) << 4) | self.flags());
        write_variable_int(buf, remaining)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Properties;
    use crate::types::{QoS, SubscriptionOptions};

    fn round_trip(packet: Packet) {
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_every_kind() {
        let mut publish = Publish::new("a/b", Bytes::from_static(b"payload"), QoS::ExactlyOnce);
        publish.packet_id = 10;
        publish.dup = true;

        let packets = vec![
            Packet::Connect(Connect::new("client", 60)),
            Packet::ConnAck(ConnAck::new(ReasonCode::SUCCESS)),
            Packet::Publish(publish),
            Packet::PubAck(PubAck::new(1)),
            Packet::PubRec(PubAck::with_reason(2, ReasonCode::NO_MATCHING_SUBSCRIBERS)),
            Packet::PubRel(PubAck::new(3)),
            Packet::PubComp(PubAck::new(4)),
            Packet::Subscribe(Subscribe::new(5).filter("x/#", SubscriptionOptions::new(QoS::AtLeastOnce))),
            Packet::SubAck(SubAck {
                packet_id: 5,
                properties: Properties::default(),
                reason_codes: vec![ReasonCode::GRANTED_QOS_1],
            }),
            Packet::Unsubscribe(Unsubscribe::new(6).filter("x/#")),
            Packet::UnsubAck(UnsubAck {
                packet_id: 6,
                properties: Properties::default(),
                reason_codes: vec![ReasonCode::NO_SUBSCRIPTION_EXISTED],
            }),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect(Disconnect::new(ReasonCode::NORMAL_DISCONNECTION)),
            Packet::Auth(Auth::new(ReasonCode::CONTINUE_AUTHENTICATION)),
        ];

        for packet in packets {
            round_trip(packet);
        }
    }

    #[test]
    fn test_reserved_flags() {
        // SUBSCRIBE with low nibble 0 instead of 0b0010.
        let err = Packet::decode(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x01, b'a']).unwrap_err();
        assert_eq!(err.code, ReasonCode::MALFORMED_PACKET);

        // PINGREQ with a flag bit set.
        assert!(Packet::decode(&[0xC1, 0x00]).is_err());
        assert_eq!(Packet::decode(&[0xC0, 0x00]).unwrap(), Packet::PingReq);

        // PUBREL must carry 0b0010.
        assert!(Packet::decode(&[0x60, 0x02, 0x00, 0x01]).is_err());
        assert!(Packet::decode(&[0x62, 0x02, 0x00, 0x01]).is_ok());
    }

    #[test]
    fn test_type_zero_is_invalid() {
        assert!(Packet::decode(&[0x00, 0x00]).is_err());
    }

    #[test]
    fn test_read_partial_and_oversized() {
        let bytes = Packet::PingResp.to_bytes().unwrap();
        assert_eq!(Packet::read(&bytes[..1], 1024).unwrap(), None);
        let (packet, used) = Packet::read(&bytes, 1024).unwrap().unwrap();
        assert_eq!(packet, Packet::PingResp);
        assert_eq!(used, 2);

        let big = Packet::Publish(Publish::new("t", Bytes::from(vec![0u8; 200]), QoS::AtMostOnce))
            .to_bytes()
            .unwrap();
        let err = Packet::read(&big, 100).unwrap_err();
        assert_eq!(err.code, ReasonCode::PACKET_TOO_LARGE);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        assert!(Packet::decode(&[0xC0, 0x00, 0x00]).is_err());
        assert!(Packet::decode(&[0xD0, 0x01]).is_err());
    }

    #[test]
    fn test_pingreq_trailing_bytes() {
        assert!(Packet::decode(&[0xC0, 0x01, 0x00]).is_err());
    }
}
