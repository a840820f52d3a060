//! MQTT 5.0 property handling.
//!
//! Properties are a length-prefixed sequence of `identifier, value` entries.
//! The value shape is fixed per identifier. Only User Property and
//! Subscription Identifier may repeat; any other identifier appearing twice is
//! a Protocol Error tagged with that identifier.
//!
//! Decoding stops at the first identifier this module does not know; the rest
//! of the property block is skipped rather than rejected.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{Reader, variable_int_len, write_binary, write_string, write_variable_int};
use crate::error::ProtocolError;
use crate::types::ReasonCode;

/// MQTT 5.0 property identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyId {
    PayloadFormatIndicator = 0x01,
    MessageExpiryInterval = 0x02,
    ContentType = 0x03,
    ResponseTopic = 0x08,
    CorrelationData = 0x09,
    SubscriptionIdentifier = 0x0B,
    SessionExpiryInterval = 0x11,
    AssignedClientIdentifier = 0x12,
    ServerKeepAlive = 0x13,
    AuthenticationMethod = 0x15,
    AuthenticationData = 0x16,
    RequestProblemInformation = 0x17,
    WillDelayInterval = 0x18,
    RequestResponseInformation = 0x19,
    ResponseInformation = 0x1A,
    ServerReference = 0x1C,
    ReasonString = 0x1F,
    ReceiveMaximum = 0x21,
    TopicAliasMaximum = 0x22,
    TopicAlias = 0x23,
    MaximumQoS = 0x24,
    RetainAvailable = 0x25,
    UserProperty = 0x26,
    MaximumPacketSize = 0x27,
    WildcardSubscriptionAvailable = 0x28,
    SubscriptionIdentifierAvailable = 0x29,
    SharedSubscriptionAvailable = 0x2A,
}

impl PropertyId {
    /// Try to parse a property ID from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::PayloadFormatIndicator),
            0x02 => Some(Self::MessageExpiryInterval),
            0x03 => Some(Self::ContentType),
            0x08 => Some(Self::ResponseTopic),
            0x09 => Some(Self::CorrelationData),
            0x0B => Some(Self::SubscriptionIdentifier),
            0x11 => Some(Self::SessionExpiryInterval),
            0x12 => Some(Self::AssignedClientIdentifier),
            0x13 => Some(Self::ServerKeepAlive),
            0x15 => Some(Self::AuthenticationMethod),
            0x16 => Some(Self::AuthenticationData),
            0x17 => Some(Self::RequestProblemInformation),
            0x18 => Some(Self::WillDelayInterval),
            0x19 => Some(Self::RequestResponseInformation),
            0x1A => Some(Self::ResponseInformation),
            0x1C => Some(Self::ServerReference),
            0x1F => Some(Self::ReasonString),
            0x21 => Some(Self::ReceiveMaximum),
            0x22 => Some(Self::TopicAliasMaximum),
            0x23 => Some(Self::TopicAlias),
            0x24 => Some(Self::MaximumQoS),
            0x25 => Some(Self::RetainAvailable),
            0x26 => Some(Self::UserProperty),
            0x27 => Some(Self::MaximumPacketSize),
            0x28 => Some(Self::WildcardSubscriptionAvailable),
            0x29 => Some(Self::SubscriptionIdentifierAvailable),
            0x2A => Some(Self::SharedSubscriptionAvailable),
            _ => None,
        }
    }
}

/// Property set of a single packet.
///
/// One record serves every packet kind; each packet only fills in the
/// properties the protocol allows for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    pub payload_format_indicator: Option<bool>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<bool>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<bool>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
}

fn set_once<T>(slot: &mut Option<T>, id: PropertyId, value: T) -> Result<(), ProtocolError> {
    if slot.is_some() {
        return Err(ProtocolError::property(
            id as u8,
            ReasonCode::PROTOCOL_ERROR,
            format!("duplicate property {:?}", id),
        ));
    }
    *slot = Some(value);
    Ok(())
}

fn read_flag(r: &mut Reader<'_>, id: PropertyId) -> Result<bool, ProtocolError> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        v => Err(ProtocolError::property(
            id as u8,
            ReasonCode::PROTOCOL_ERROR,
            format!("{:?} must be 0 or 1, got {}", id, v),
        )),
    }
}

fn non_zero_u16(r: &mut Reader<'_>, id: PropertyId) -> Result<u16, ProtocolError> {
    let v = r.read_u16()?;
    if v == 0 {
        return Err(ProtocolError::property(
            id as u8,
            ReasonCode::PROTOCOL_ERROR,
            format!("{:?} must not be 0", id),
        ));
    }
    Ok(v)
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Properties::default()
    }

    /// Decode a length-prefixed property block.
    pub fn read(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let len = r.read_variable_int()? as usize;
        let mut block = r.sub_reader(len)?;
        let mut props = Properties::default();

        while !block.is_empty() {
            let Some(id) = PropertyId::from_byte(block.read_u8()?) else {
                // Unknown identifier: treat as end of recognized properties.
                break;
            };
            props.read_one(id, &mut block)?;
        }

        Ok(props)
    }

    fn read_one(&mut self, id: PropertyId, r: &mut Reader<'_>) -> Result<(), ProtocolError> {
        use PropertyId::*;

        match id {
            PayloadFormatIndicator => set_once(&mut self.payload_format_indicator, id, read_flag(r, id)?),
            MessageExpiryInterval => set_once(&mut self.message_expiry_interval, id, r.read_u32()?),
            ContentType => set_once(&mut self.content_type, id, r.read_string()?),
            ResponseTopic => set_once(&mut self.response_topic, id, r.read_string()?),
            CorrelationData => set_once(&mut self.correlation_data, id, r.read_binary()?),
            SubscriptionIdentifier => {
                let v = r.read_variable_int()?;
                if v == 0 {
                    return Err(ProtocolError::property(
                        id as u8,
                        ReasonCode::PROTOCOL_ERROR,
                        "subscription identifier must not be 0",
                    ));
                }
                self.subscription_identifiers.push(v);
                Ok(())
            }
            SessionExpiryInterval => set_once(&mut self.session_expiry_interval, id, r.read_u32()?),
            AssignedClientIdentifier => {
                set_once(&mut self.assigned_client_identifier, id, r.read_string()?)
            }
            ServerKeepAlive => set_once(&mut self.server_keep_alive, id, r.read_u16()?),
            AuthenticationMethod => set_once(&mut self.authentication_method, id, r.read_string()?),
            AuthenticationData => set_once(&mut self.authentication_data, id, r.read_binary()?),
            RequestProblemInformation => {
                set_once(&mut self.request_problem_information, id, read_flag(r, id)?)
            }
            WillDelayInterval => set_once(&mut self.will_delay_interval, id, r.read_u32()?),
            RequestResponseInformation => {
                set_once(&mut self.request_response_information, id, read_flag(r, id)?)
            }
            ResponseInformation => set_once(&mut self.response_information, id, r.read_string()?),
            ServerReference => set_once(&mut self.server_reference, id, r.read_string()?),
            ReasonString => set_once(&mut self.reason_string, id, r.read_string()?),
            ReceiveMaximum => set_once(&mut self.receive_maximum, id, non_zero_u16(r, id)?),
            TopicAliasMaximum => set_once(&mut self.topic_alias_maximum, id, r.read_u16()?),
            TopicAlias => set_once(&mut self.topic_alias, id, r.read_u16()?),
            MaximumQoS => {
                let v = r.read_u8()?;
                if v > 1 {
                    return Err(ProtocolError::property(
                        id as u8,
                        ReasonCode::PROTOCOL_ERROR,
                        format!("maximum qos must be 0 or 1, got {}", v),
                    ));
                }
                set_once(&mut self.maximum_qos, id, v)
            }
            RetainAvailable => set_once(&mut self.retain_available, id, read_flag(r, id)?),
            UserProperty => {
                self.user_properties.push(r.read_string_pair()?);
                Ok(())
            }
            MaximumPacketSize => {
                let v = r.read_u32()?;
                if v == 0 {
                    return Err(ProtocolError::property(
                        id as u8,
                        ReasonCode::PROTOCOL_ERROR,
                        "maximum packet size must not be 0",
                    ));
                }
                set_once(&mut self.maximum_packet_size, id, v)
            }
            WildcardSubscriptionAvailable => {
                set_once(&mut self.wildcard_subscription_available, id, read_flag(r, id)?)
            }
            SubscriptionIdentifierAvailable => {
                set_once(&mut self.subscription_identifiers_available, id, read_flag(r, id)?)
            }
            SharedSubscriptionAvailable => {
                set_once(&mut self.shared_subscription_available, id, read_flag(r, id)?)
            }
        }
    }

    /// Encode the property block, including its variable-length prefix.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        self.write_body(&mut body)?;
        let len = u32::try_from(body.len())
            .map_err(|_| ProtocolError::malformed("property block too large"))?;
        buf.reserve(variable_int_len(len) + body.len());
        write_variable_int(buf, len)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn write_body(&self, b: &mut BytesMut) -> Result<(), ProtocolError> {
        use PropertyId::*;

        let flag = |b: &mut BytesMut, id: PropertyId, v: Option<bool>| {
            if let Some(v) = v {
                b.put_u8(id as u8);
                b.put_u8(v as u8);
            }
        };
        let u16_prop = |b: &mut BytesMut, id: PropertyId, v: Option<u16>| {
            if let Some(v) = v {
                b.put_u8(id as u8);
                b.put_u16(v);
            }
        };
        let u32_prop = |b: &mut BytesMut, id: PropertyId, v: Option<u32>| {
            if let Some(v) = v {
                b.put_u8(id as u8);
                b.put_u32(v);
            }
        };
        let str_prop = |b: &mut BytesMut, id: PropertyId, v: &Option<String>| -> Result<(), ProtocolError> {
            if let Some(v) = v {
                b.put_u8(id as u8);
                write_string(b, v)?;
            }
            Ok(())
        };
        let bin_prop = |b: &mut BytesMut, id: PropertyId, v: &Option<Bytes>| -> Result<(), ProtocolError> {
            if let Some(v) = v {
                b.put_u8(id as u8);
                write_binary(b, v)?;
            }
            Ok(())
        };

        flag(b, PayloadFormatIndicator, self.payload_format_indicator);
        u32_prop(b, MessageExpiryInterval, self.message_expiry_interval);
        str_prop(b, ContentType, &self.content_type)?;
        str_prop(b, ResponseTopic, &self.response_topic)?;
        bin_prop(b, CorrelationData, &self.correlation_data)?;
        for &id in &self.subscription_identifiers {
            b.put_u8(SubscriptionIdentifier as u8);
            write_variable_int(b, id)?;
        }
        u32_prop(b, SessionExpiryInterval, self.session_expiry_interval);
        str_prop(b, AssignedClientIdentifier, &self.assigned_client_identifier)?;
        u16_prop(b, ServerKeepAlive, self.server_keep_alive);
        str_prop(b, AuthenticationMethod, &self.authentication_method)?;
        bin_prop(b, AuthenticationData, &self.authentication_data)?;
        flag(b, RequestProblemInformation, self.request_problem_information);
        u32_prop(b, WillDelayInterval, self.will_delay_interval);
        flag(b, RequestResponseInformation, self.request_response_information);
        str_prop(b, ResponseInformation, &self.response_information)?;
        str_prop(b, ServerReference, &self.server_reference)?;
        str_prop(b, ReasonString, &self.reason_string)?;
        u16_prop(b, ReceiveMaximum, self.receive_maximum);
        u16_prop(b, TopicAliasMaximum, self.topic_alias_maximum);
        u16_prop(b, TopicAlias, self.topic_alias);
        if let Some(v) = self.maximum_qos {
            b.put_u8(MaximumQoS as u8);
            b.put_u8(v);
        }
        flag(b, RetainAvailable, self.retain_available);
        for (key, value) in &self.user_properties {
            b.put_u8(UserProperty as u8);
            write_string(b, key)?;
            write_string(b, value)?;
        }
        u32_prop(b, MaximumPacketSize, self.maximum_packet_size);
        flag(b, WildcardSubscriptionAvailable, self.wildcard_subscription_available);
        flag(b, SubscriptionIdentifierAvailable, self.subscription_identifiers_available);
        flag(b, SharedSubscriptionAvailable, self.shared_subscription_available);

        Ok(())
    }
}
