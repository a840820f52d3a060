//! Frame accumulation for message-oriented and chunked transports.

use bytes::{Bytes, BytesMut};

use super::packet::read_fixed_header;
use crate::error::ProtocolError;
use crate::types::ReasonCode;

/// Accumulates inbound bytes until complete MQTT frames are available.
///
/// A frame boundary is derived from the remaining-length field, so inbound
/// chunks may split or join frames arbitrarily.
#[derive(Debug)]
pub struct Framer {
    buf: BytesMut,
    max_size: usize,
}

impl Framer {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_size,
        }
    }

    /// Append inbound bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Split off the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let Some(header) = read_fixed_header(&self.buf)? else {
            return Ok(None);
        };
        let total = header.frame_length();
        if total > self.max_size {
            return Err(ProtocolError::new(
                ReasonCode::PACKET_TOO_LARGE,
                format!("packet of {} bytes exceeds maximum {}", total, self.max_size),
            ));
        }
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).freeze()))
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;

    #[test]
    fn test_split_and_joined_frames() {
        let ping = Packet::PingReq.to_bytes().unwrap();
        let disconnect = [0xE0, 0x01, 0x00];

        let mut joined = ping.to_vec();
        joined.extend_from_slice(&disconnect);

        let mut framer = Framer::new(1024);
        framer.extend(&joined[..3]);
        assert_eq!(framer.next_frame().unwrap().unwrap(), ping);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.extend(&joined[3..]);
        assert_eq!(&framer.next_frame().unwrap().unwrap()[..], &disconnect);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_length_split_across_chunks() {
        let frame = Packet::Publish(crate::protocol::Publish::new(
            "t",
            Bytes::from(vec![7u8; 300]),
            crate::types::QoS::AtMostOnce,
        ))
        .to_bytes()
        .unwrap();

        let mut framer = Framer::new(4096);
        framer.extend(&frame[..2]);
        assert_eq!(framer.next_frame().unwrap(), None);
        framer.extend(&frame[2..]);
        assert_eq!(framer.next_frame().unwrap().unwrap(), frame);
    }

    #[test]
    fn test_oversized_frame() {
        let mut framer = Framer::new(16);
        framer.extend(&[0x30, 0x7F]);
        let err = framer.next_frame().unwrap_err();
        assert_eq!(err.code, ReasonCode::PACKET_TOO_LARGE);
    }
}
