//! CONNECT and CONNACK bodies.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{Reader, write_binary, write_string};
use super::properties::Properties;
use super::{PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::error::ProtocolError;
use crate::types::{QoS, ReasonCode};

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub properties: Properties,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// Last Will and Testament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub properties: Properties,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Connect {
    /// A clean-start CONNECT with the given client identifier and keep-alive.
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            clean_start: true,
            keep_alive,
            properties: Properties::default(),
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let name = r.read_string()?;
        let version = r.read_u8()?;
        if name != PROTOCOL_NAME || version != PROTOCOL_VERSION {
            return Err(ProtocolError::new(
                ReasonCode::UNSUPPORTED_PROTOCOL_VERSION,
                format!("unsupported protocol {:?} level {}", name, version),
            ));
        }

        let flags = r.read_u8()?;
        if flags & 0x01 != 0 {
            return Err(ProtocolError::malformed("connect flags: reserved bit set"));
        }
        let clean_start = flags & 0x02 != 0;
        let will_flag = flags & 0x04 != 0;
        let will_qos_bits = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let password_flag = flags & 0x40 != 0;
        let username_flag = flags & 0x80 != 0;

        let will_qos = QoS::from_u8(will_qos_bits)
            .ok_or_else(|| ProtocolError::malformed("connect flags: will qos 3"))?;
        if !will_flag && (will_qos_bits != 0 || will_retain) {
            return Err(ProtocolError::malformed(
                "connect flags: will qos or retain set without will flag",
            ));
        }

        let keep_alive = r.read_u16()?;
        let properties = Properties::read(r)?;
        let client_id = r.read_string()?;

        let will = if will_flag {
            let properties = Properties::read(r)?;
            let topic = r.read_string()?;
            let payload = r.read_binary()?;
            Some(Will {
                properties,
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag { Some(r.read_string()?) } else { None };
        let password = if password_flag { Some(r.read_binary()?) } else { None };

        if !r.is_empty() {
            return Err(ProtocolError::malformed("trailing bytes after connect payload"));
        }

        Ok(Connect {
            clean_start,
            keep_alive,
            properties,
            client_id,
            will,
            username,
            password,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_VERSION);

        let mut flags = 0u8;
        if self.clean_start {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);
        self.properties.write(buf)?;
        write_string(buf, &self.client_id)?;

        if let Some(will) = &self.will {
            will.properties.write(buf)?;
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(username) = &self.username {
            write_string(buf, username)?;
        }
        if let Some(password) = &self.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }
}

impl ConnAck {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            session_present: false,
            reason_code,
            properties: Properties::default(),
        }
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let ack_flags = r.read_u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(ProtocolError::malformed("connack flags: reserved bits set"));
        }
        let reason_code = ReasonCode(r.read_u8()?);
        let properties = if r.is_empty() { Properties::default() } else { Properties::read(r)? };
        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        })
    }

    pub(crate) fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.session_present as u8);
        buf.put_u8(self.reason_code.0);
        self.properties.write(buf)
    }
}
