//! SUBSCRIBE, SUBACK, UNSUBSCRIBE and UNSUBACK bodies.

use bytes::{BufMut, BytesMut};

use super::codec::{Reader, write_string};
use super::properties::Properties;
use crate::error::ProtocolError;
use crate::types::{QoS, ReasonCode, RetainHandling, SubscriptionOptions};

/// SUBSCRIBE packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub filters: Vec<(String, SubscriptionOptions)>,
}

/// SUBACK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub properties: Properties,
    pub reason_codes: Vec<ReasonCode>,
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: Properties,
    pub filters: Vec<String>,
}

/// UNSUBACK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    pub properties: Properties,
    pub reason_codes: Vec<ReasonCode>,
}

fn read_packet_id(r: &mut Reader<'_>) -> Result<u16, ProtocolError> {
    let id = r.read_u16()?;
    if id == 0 {
        return Err(ProtocolError::malformed("packet identifier 0"));
    }
    Ok(id)
}

fn decode_options(byte: u8) -> Result<SubscriptionOptions, ProtocolError> {
    if byte & 0xC0 != 0 {
        return Err(ProtocolError::malformed("subscription options: reserved bits set"));
    }
    let qos = QoS::from_u8(byte & 0x03)
        .ok_or_else(|| ProtocolError::malformed("subscription options: qos 3"))?;
    let retain_handling = RetainHandling::from_u8((byte >> 4) & 0x03)
        .ok_or_else(|| ProtocolError::protocol("subscription options: retain handling 3"))?;
    Ok(SubscriptionOptions {
        qos,
        no_local: byte & 0x04 != 0,
        retain_as_published: byte & 0x08 != 0,
        retain_handling,
    })
}

impl Subscribe {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: impl Into<String>, options: SubscriptionOptions) -> Self {
        self.filters.push((filter.into(), options));
        self
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let packet_id = read_packet_id(r)?;
        let properties = Properties::read(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            let filter = r.read_string()?;
            let options = decode_options(r.read_u8()?)?;
            filters.push((filter, options));
        }
        if filters.is_empty() {
            return Err(ProtocolError::protocol("subscribe without topic filters"));
        }

        Ok(Subscribe {
            packet_id,
            properties,
            filters,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;
        for (filter, options) in &self.filters {
            write_string(buf, filter)?;
            buf.put_u8(options.to_byte());
        }
        Ok(())
    }
}

impl SubAck {
    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let packet_id = read_packet_id(r)?;
        let properties = Properties::read(r)?;
        let reason_codes = r.rest().iter().map(|&b| ReasonCode(b)).collect();
        Ok(SubAck {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;
        for code in &self.reason_codes {
            buf.put_u8(code.0);
        }
        Ok(())
    }
}

impl Unsubscribe {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let packet_id = read_packet_id(r)?;
        let properties = Properties::read(r)?;

        let mut filters = Vec::new();
        while !r.is_empty() {
            filters.push(r.read_string()?);
        }
        if filters.is_empty() {
            return Err(ProtocolError::protocol("unsubscribe without topic filters"));
        }

        Ok(Unsubscribe {
            packet_id,
            properties,
            filters,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;
        for filter in &self.filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }
}

impl UnsubAck {
    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let packet_id = read_packet_id(r)?;
        let properties = Properties::read(r)?;
        let reason_codes = r.rest().iter().map(|&b| ReasonCode(b)).collect();
        Ok(UnsubAck {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u16(self.packet_id);
        self.properties.write(buf)?;
        for code in &self.reason_codes {
            buf.put_u8(code.0);
        }
        Ok(())
    }
}
