// SPDX-License-Identifier: MIT OR Apache-2.0
//! Version-aware primitive streams.
//!
//! Every stream carries the connection version it is written or read at.
//! Gated writes and reads consult that version through the same predicate,
//! which keeps both sides of a connection in agreement about which fields
//! are present.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::{Result, TransportError},
    node::Version,
};

/// Output stream that message bodies are written into.
#[derive(Debug)]
pub struct StreamOutput {
    buf: BytesMut,
    version: Version,
}

impl StreamOutput {
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self {
            buf: BytesMut::new(),
            version,
        }
    }

    #[must_use]
    pub fn with_capacity(version: Version, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            version,
        }
    }

    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Variable-length unsigned int, 7 bits per byte, low groups first.
    pub fn write_vint(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_byte_slice(value.as_bytes());
    }

    /// Length-prefixed byte slice.
    pub fn write_byte_slice(&mut self, value: &[u8]) {
        let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
        self.write_vint(len);
        self.buf.put_slice(&value[..len as usize]);
    }

    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Writes `value` only when the stream version is on or after `since`.
    pub fn write_gated<T: WireValue>(&mut self, since: Version, value: &T) {
        if self.version.on_or_after(since) {
            value.write(self);
        }
    }
}

/// Input stream that message bodies are decoded from.
#[derive(Debug)]
pub struct StreamInput<'a> {
    buf: &'a [u8],
    version: Version,
}

impl<'a> StreamInput<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8], version: Version) -> Self {
        Self { buf, version }
    }

    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.len() < needed {
            return Err(TransportError::Serialization(format!(
                "unexpected end of stream reading {what}: need {needed} bytes, have {}",
                self.buf.len()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(TransportError::Serialization(format!(
                "invalid bool byte {other:#04x}"
            ))),
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub fn read_vint(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(TransportError::Serialization(
            "vint longer than 5 bytes".to_string(),
        ))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_byte_vec()?;
        String::from_utf8(bytes)
            .map_err(|e| TransportError::Serialization(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_byte_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.read_vint()? as usize;
        self.ensure(len, "byte array")?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head.to_vec())
    }

    /// Reads into `slot` only when the stream version is on or after `since`.
    /// Otherwise the slot keeps whatever value it already holds.
    pub fn read_gated<T: WireValue>(&mut self, since: Version, slot: &mut T) -> Result<()> {
        if self.version.on_or_after(since) {
            *slot = T::read(self)?;
        }
        Ok(())
    }
}

/// A primitive value with a fixed wire encoding.
pub trait WireValue: Sized {
    fn write(&self, out: &mut StreamOutput);

    /// # Errors
    ///
    /// Returns `Serialization` if the stream is truncated or malformed.
    fn read(input: &mut StreamInput<'_>) -> Result<Self>;
}

macro_rules! wire_primitive {
    ($ty:ty, $write:ident, $read:ident) => {
        impl WireValue for $ty {
            fn write(&self, out: &mut StreamOutput) {
                out.$write(*self);
            }

            fn read(input: &mut StreamInput<'_>) -> Result<Self> {
                input.$read()
            }
        }
    };
}

wire_primitive!(u8, write_u8, read_u8);
wire_primitive!(bool, write_bool, read_bool);
wire_primitive!(i32, write_i32, read_i32);
wire_primitive!(u32, write_u32, read_u32);
wire_primitive!(i64, write_i64, read_i64);
wire_primitive!(u64, write_u64, read_u64);

impl WireValue for String {
    fn write(&self, out: &mut StreamOutput) {
        out.write_string(self);
    }

    fn read(input: &mut StreamInput<'_>) -> Result<Self> {
        input.read_string()
    }
}

impl<T: WireValue> WireValue for Option<T> {
    fn write(&self, out: &mut StreamOutput) {
        match self {
            Some(value) => {
                out.write_bool(true);
                value.write(out);
            },
            None => out.write_bool(false),
        }
    }

    fn read(input: &mut StreamInput<'_>) -> Result<Self> {
        if input.read_bool()? {
            Ok(Some(T::read(input)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn write(&self, out: &mut StreamOutput) {
        let len = u32::try_from(self.len()).unwrap_or(u32::MAX);
        out.write_vint(len);
        for value in self.iter().take(len as usize) {
            value.write(out);
        }
    }

    fn read(input: &mut StreamInput<'_>) -> Result<Self> {
        let len = input.read_vint()? as usize;
        // Every element takes at least one byte.
        if len > input.remaining() {
            return Err(TransportError::Serialization(format!(
                "vector length {len} exceeds remaining {} bytes",
                input.remaining()
            )));
        }
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(T::read(input)?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vint_boundaries() {
        for value in [0u32, 1, 127, 128, 16_383, 16_384, u32::MAX] {
            let mut out = StreamOutput::new(Version::CURRENT);
            out.write_vint(value);
            let bytes = out.into_bytes();
            let mut input = StreamInput::new(&bytes, Version::CURRENT);
            assert_eq!(input.read_vint().unwrap(), value);
            assert!(input.is_exhausted());
        }
    }

    #[test]
    fn test_vint_single_byte_below_128() {
        let mut out = StreamOutput::new(Version::CURRENT);
        out.write_vint(127);
        assert_eq!(out.len(), 1);
        out.write_vint(128);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_string_and_integers() {
        let mut out = StreamOutput::new(Version::CURRENT);
        out.write_string("hello moshe");
        out.write_i32(-5);
        out.write_u64(u64::MAX);
        out.write_bool(true);

        let bytes = out.into_bytes();
        let mut input = StreamInput::new(&bytes, Version::CURRENT);
        assert_eq!(input.read_string().unwrap(), "hello moshe");
        assert_eq!(input.read_i32().unwrap(), -5);
        assert_eq!(input.read_u64().unwrap(), u64::MAX);
        assert!(input.read_bool().unwrap());
        assert!(input.is_exhausted());
    }

    #[test]
    fn test_truncated_read_errors() {
        let bytes = [0u8, 1];
        let mut input = StreamInput::new(&bytes, Version::CURRENT);
        let err = input.read_i32().unwrap_err();
        assert!(matches!(err, TransportError::Serialization(_)));
    }

    #[test]
    fn test_string_length_beyond_buffer() {
        let mut out = StreamOutput::new(Version::CURRENT);
        out.write_vint(50);
        out.write_raw(b"short");
        let bytes = out.into_bytes();
        let mut input = StreamInput::new(&bytes, Version::CURRENT);
        assert!(input.read_string().is_err());
    }

    #[test]
    fn test_invalid_bool() {
        let bytes = [7u8];
        let mut input = StreamInput::new(&bytes, Version::CURRENT);
        assert!(input.read_bool().is_err());
    }

    #[test]
    fn test_gated_write_skipped_below_version() {
        let since = Version::from_id(199);

        let mut old = StreamOutput::new(Version::from_id(99));
        old.write_gated(since, &42i32);
        assert!(old.is_empty());

        let mut new = StreamOutput::new(Version::from_id(199));
        new.write_gated(since, &42i32);
        assert_eq!(new.len(), 4);
    }

    #[test]
    fn test_gated_read_leaves_slot_untouched() {
        let bytes: [u8; 0] = [];
        let mut input = StreamInput::new(&bytes, Version::from_id(99));
        let mut slot = 0i32;
        input.read_gated(Version::from_id(199), &mut slot).unwrap();
        assert_eq!(slot, 0);
    }

    #[test]
    fn test_option_and_vec() {
        let mut out = StreamOutput::new(Version::CURRENT);
        Some("x".to_string()).write(&mut out);
        None::<u32>.write(&mut out);
        vec![1u64, 2, 3].write(&mut out);

        let bytes = out.into_bytes();
        let mut input = StreamInput::new(&bytes, Version::CURRENT);
        assert_eq!(
            Option::<String>::read(&mut input).unwrap(),
            Some("x".to_string())
        );
        assert_eq!(Option::<u32>::read(&mut input).unwrap(), None);
        assert_eq!(Vec::<u64>::read(&mut input).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_vec_length_guard() {
        let mut out = StreamOutput::new(Version::CURRENT);
        out.write_vint(1_000_000);
        let bytes = out.into_bytes();
        let mut input = StreamInput::new(&bytes, Version::CURRENT);
        assert!(Vec::<u8>::read(&mut input).is_err());
    }
}
