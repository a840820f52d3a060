//! MQTT packet encoding/decoding utilities.
//!
//! This module provides low-level encoding and decoding functions
//! for MQTT protocol primitives. Decoding goes through [`Reader`], a cursor
//! that never reads past the slice it was given.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Largest value a variable byte integer can carry (four bytes).
pub const MAX_VARIABLE_INT: u32 = 268_435_455;

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `Ok(Some((value, bytes_consumed)))`, `Ok(None)` if the buffer ends
/// before the last byte, or an error if a fifth byte would be required.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let mut multiplier = 1u32;
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(ProtocolError::malformed("variable byte integer exceeds 4 bytes"));
        }

        value += (byte & 0x7F) as u32 * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(ProtocolError::malformed("variable byte integer exceeds 4 bytes"));
    }

    Ok(None)
}

/// Write a variable-length integer.
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), ProtocolError> {
    if value > MAX_VARIABLE_INT {
        return Err(ProtocolError::malformed(format!(
            "variable byte integer {} out of range",
            value
        )));
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);

        if value == 0 {
            return Ok(());
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len())
        .map_err(|_| ProtocolError::malformed(format!("field of {} bytes exceeds 65535", data.len())))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Bounds-checked read cursor over one packet body.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::malformed(format!(
                "{}: need {} bytes, {} left",
                what,
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1, "byte")?[0])
    }

    /// Read a 2-byte big-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2, "two byte integer")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a 4-byte big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4, "four byte integer")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_variable_int(&mut self) -> Result<u32, ProtocolError> {
        match read_variable_int(&self.buf[self.pos..])? {
            Some((value, len)) => {
                self.pos += len;
                Ok(value)
            }
            None => Err(ProtocolError::malformed("truncated variable byte integer")),
        }
    }

    /// Read binary data as a slice (2-byte length prefix + data).
    pub fn read_binary_slice(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u16()? as usize;
        self.take(len, "binary data")
    }

    pub fn read_binary(&mut self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::copy_from_slice(self.read_binary_slice()?))
    }

    /// Read a UTF-8 string (2-byte length prefix + data).
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_binary_slice()?;
        let s = std::str::from_utf8(raw).map_err(|_| ProtocolError::malformed("invalid utf-8 string"))?;
        if s.contains('\0') {
            return Err(ProtocolError::malformed("utf-8 string contains U+0000"));
        }
        Ok(s.to_string())
    }

    pub fn read_string_pair(&mut self) -> Result<(String, String), ProtocolError> {
        let key = self.read_string()?;
        let value = self.read_string()?;
        Ok((key, value))
    }

    /// Split off the next `n` bytes as an independent reader.
    pub fn sub_reader(&mut self, n: usize) -> Result<Reader<'a>, ProtocolError> {
        Ok(Reader::new(self.take(n, "nested block")?))
    }

    /// Consume everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}
