//! PUBLISH body.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{Reader, write_string};
use super::properties::Properties;
use crate::error::ProtocolError;
use crate::types::QoS;

/// PUBLISH packet.
///
/// `packet_id` is 0 for QoS 0. The topic may be empty when the packet carries
/// a Topic Alias that the receiver resolves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: u16,
    pub properties: Properties,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            ..Default::default()
        }
    }

    /// Fixed-header flag nibble.
    pub(crate) fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    pub(crate) fn read(flags: u8, r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let qos = QoS::from_u8((flags >> 1) & 0x03)
            .ok_or_else(|| ProtocolError::malformed("publish: qos 3"))?;
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(ProtocolError::malformed("publish: dup set on qos 0"));
        }

        let topic = r.read_string()?;
        let packet_id = if qos > QoS::AtMostOnce {
            let id = r.read_u16()?;
            if id == 0 {
                return Err(ProtocolError::malformed("publish: packet identifier 0"));
            }
            id
        } else {
            0
        };
        let properties = Properties::read(r)?;
        let payload = Bytes::copy_from_slice(r.rest());

        Ok(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        write_string(buf, &self.topic)?;
        if self.qos > QoS::AtMostOnce {
            buf.put_u16(self.packet_id);
        }
        self.properties.write(buf)?;
        buf.put_slice(&self.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReasonCode;

    #[test]
    fn test_publish_qos1() {
        let mut publish = Publish::new("home/kitchen/temp", Bytes::from_static(b"21.5"), QoS::AtLeastOnce);
        publish.packet_id = 42;
        publish.retain = true;
        publish.properties.message_expiry_interval = Some(60);

        let mut buf = BytesMut::new();
        publish.write(&mut buf).unwrap();
        let decoded = Publish::read(publish.flags(), &mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, publish);
    }

    #[test]
    fn test_publish_qos0_has_no_packet_id() {
        let publish = Publish::new("a", Bytes::from_static(b"x"), QoS::AtMostOnce);
        let mut buf = BytesMut::new();
        publish.write(&mut buf).unwrap();
        // topic (3) + properties (1) + payload (1)
        assert_eq!(buf.len(), 5);
        assert_eq!(publish.flags(), 0);
    }

    #[test]
    fn test_publish_invalid_flags() {
        let mut buf = BytesMut::new();
        Publish::new("a", Bytes::new(), QoS::AtMostOnce).write(&mut buf).unwrap();

        let err = Publish::read(0x06, &mut Reader::new(&buf)).unwrap_err();
        assert_eq!(err.code, ReasonCode::MALFORMED_PACKET);
        let err = Publish::read(0x08, &mut Reader::new(&buf)).unwrap_err();
        assert_eq!(err.code, ReasonCode::MALFORMED_PACKET);
    }

    #[test]
    fn test_publish_zero_packet_id() {
        let raw = [0x00, 0x01, b'a', 0x00, 0x00, 0x00];
        assert!(Publish::read(0x02, &mut Reader::new(&raw)).is_err());
    }
}
