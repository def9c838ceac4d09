//! Typed read/write primitives for message payloads.
//!
//! Messages serialise into an in-memory buffer before framing, and parse
//! from the received payload after framing. All integers travel in network
//! byte order; byte strings are `u32`-length-prefixed; vectors are an `i16`
//! count followed by the elements.

use crate::error::{ProtocolError, ProtocolResult};

/// Serialises message fields into a frame payload.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buffer: Vec<u8>,
}

impl MessageWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the writer, returning the payload bytes.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.buffer
    }

    /// Writes a signed 64-bit integer.
    pub fn put_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a signed 32-bit integer.
    pub fn put_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a signed 16-bit integer.
    pub fn put_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a signed 8-bit integer.
    pub fn put_i8(&mut self, value: i8) {
        self.buffer.push(value as u8);
    }

    /// Writes a boolean as an 8-bit integer.
    pub fn put_bool(&mut self, value: bool) {
        self.put_i8(i8::from(value));
    }

    /// Writes a length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_i32(value.len() as i32);
        self.buffer.extend_from_slice(value);
    }

    /// Writes a counted vector of 64-bit integers.
    pub fn put_i64_vec(&mut self, values: &[i64]) {
        self.put_i16(values.len() as i16);
        for &value in values {
            self.put_i64(value);
        }
    }
}

/// Parses message fields out of a frame payload.
#[derive(Debug)]
pub struct MessageReader<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> MessageReader<'a> {
    /// Wraps a received payload.
    #[must_use]
    pub fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.offset
    }

    /// Fails unless every payload byte was consumed.
    pub fn finish(self) -> ProtocolResult<()> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(ProtocolError::PayloadTrailing(extra)),
        }
    }

    fn take(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::PayloadTruncated);
        }
        let slice = &self.payload[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    /// Reads a signed 64-bit integer.
    pub fn get_i64(&mut self) -> ProtocolResult<i64> {
        Ok(i64::from_be_bytes(
            self.take(8)?.try_into().expect("length checked"),
        ))
    }

    /// Reads a signed 32-bit integer.
    pub fn get_i32(&mut self) -> ProtocolResult<i32> {
        Ok(i32::from_be_bytes(
            self.take(4)?.try_into().expect("length checked"),
        ))
    }

    /// Reads a signed 16-bit integer.
    pub fn get_i16(&mut self) -> ProtocolResult<i16> {
        Ok(i16::from_be_bytes(
            self.take(2)?.try_into().expect("length checked"),
        ))
    }

    /// Reads a signed 8-bit integer.
    pub fn get_i8(&mut self) -> ProtocolResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    /// Reads a boolean.
    pub fn get_bool(&mut self) -> ProtocolResult<bool> {
        Ok(self.get_i8()? != 0)
    }

    /// Reads a length-prefixed byte string.
    pub fn get_bytes(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.get_i32()?;
        let len = usize::try_from(len).map_err(|_| ProtocolError::PayloadTruncated)?;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a counted vector of 64-bit integers.
    pub fn get_i64_vec(&mut self) -> ProtocolResult<Vec<i64>> {
        let count = self.get_i16()?;
        let count = usize::try_from(count).map_err(|_| ProtocolError::PayloadTruncated)?;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.get_i64()?);
        }
        Ok(values)
    }
}
