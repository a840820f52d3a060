//! Acknowledgement-shaped bodies: PUBACK/PUBREC/PUBREL/PUBCOMP, DISCONNECT
//! and AUTH.
//!
//! All of them may drop their trailing fields when the reason code is Success
//! (0x00) and there are no properties.

use bytes::{BufMut, BytesMut};

use super::codec::Reader;
use super::properties::Properties;
use crate::error::ProtocolError;
use crate::types::ReasonCode;

/// Body shared by PUBACK, PUBREC, PUBREL and PUBCOMP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubAck {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl PubAck {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            ..Default::default()
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let packet_id = r.read_u16()?;
        if packet_id == 0 {
            return Err(ProtocolError::malformed("packet identifier 0"));
        }
        let reason_code = if r.is_empty() { ReasonCode::SUCCESS } else { ReasonCode(r.read_u8()?) };
        let properties = if r.is_empty() { Properties::default() } else { Properties::read(r)? };
        Ok(PubAck {
            packet_id,
            reason_code,
            properties,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.packet_id);
        write_reason_and_properties(buf, self.reason_code, &self.properties)
    }
}

/// DISCONNECT packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Disconnect {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let (reason_code, properties) = read_reason_and_properties(r)?;
        Ok(Disconnect {
            reason_code,
            properties,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        write_reason_and_properties(buf, self.reason_code, &self.properties)
    }
}

/// AUTH packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Auth {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let (reason_code, properties) = read_reason_and_properties(r)?;
        Ok(Auth {
            reason_code,
            properties,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        write_reason_and_properties(buf, self.reason_code, &self.properties)
    }
}

fn read_reason_and_properties(r: &mut Reader<'_>) -> Result<(ReasonCode, Properties), ProtocolError> {
    if r.is_empty() {
        return Ok((ReasonCode::SUCCESS, Properties::default()));
    }
    let reason_code = ReasonCode(r.read_u8()?);
    let properties = if r.is_empty() { Properties::default() } else { Properties::read(r)? };
    Ok((reason_code, properties))
}

fn write_reason_and_properties(
    buf: &mut BytesMut,
    reason_code: ReasonCode,
    properties: &Properties,
) -> Result<(), ProtocolError> {
    let has_properties = !properties.is_empty();
    if reason_code == ReasonCode::SUCCESS && !has_properties {
        return Ok(());
    }
    buf.put_u8(reason_code.0);
    if has_properties {
        properties.write(buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_puback_short_form() {
        let mut buf = BytesMut::new();
        PubAck::new(7).write(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x07]);
        assert_eq!(PubAck::read(&mut Reader::new(&buf)).unwrap(), PubAck::new(7));
    }

    #[test]
    fn test_puback_reason_only() {
        let ack = PubAck::with_reason(9, ReasonCode::PACKET_IDENTIFIER_NOT_FOUND);
        let mut buf = BytesMut::new();
        ack.write(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x09, 0x92]);
        assert_eq!(PubAck::read(&mut Reader::new(&buf)).unwrap(), ack);
    }

    #[test]
    fn test_disconnect_with_reason_string() {
        let mut disconnect = Disconnect::new(ReasonCode::SESSION_TAKEN_OVER);
        disconnect.properties.reason_string = Some("another connection".into());

        let mut buf = BytesMut::new();
        disconnect.write(&mut buf).unwrap();
        assert_eq!(Disconnect::read(&mut Reader::new(&buf)).unwrap(), disconnect);
    }

    #[test]
    fn test_empty_disconnect_is_normal() {
        let disconnect = Disconnect::read(&mut Reader::new(&[])).unwrap();
        assert_eq!(disconnect.reason_code, ReasonCode::NORMAL_DISCONNECTION);
    }
}
