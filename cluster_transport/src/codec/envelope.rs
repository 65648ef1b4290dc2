// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request and response envelopes.
//!
//! Wire format:
//! ```text
//! +-----------------+--------+----------------+------------------+-----------+
//! | request_id (8B) | status | version (4B)   | action           | body      |
//! | big-endian u64  | 1 byte | big-endian u32 | requests only    |           |
//! +-----------------+--------+----------------+------------------+-----------+
//! ```
//!
//! - Status bit 0: request, bit 1: error response, bit 2: body compressed
//! - Action is a vint length followed by UTF-8 bytes
//! - Body is the `Streamable` encoding at `version`, LZ4 compressed when
//!   bit 2 is set

use bytes::Bytes;

use super::{
    compression::{self, CompressionConfig, CompressionMethod},
    message::{RemoteError, Streamable},
    stream::{StreamInput, StreamOutput},
};
use crate::{
    error::{Result, TransportError},
    node::Version,
};

/// Status byte flags.
pub mod status {
    pub const REQUEST: u8 = 0x01;
    pub const ERROR: u8 = 0x02;
    pub const COMPRESS: u8 = 0x04;
    /// Bits that must be zero.
    pub const RESERVED: u8 = !(REQUEST | ERROR | COMPRESS);
}

/// Fixed header size: request id, status, version.
pub const HEADER_LEN: usize = 8 + 1 + 4;

/// A decoded frame with its body already decompressed.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request_id: u64,
    pub status: u8,
    /// Version the sender encoded the body at.
    pub version: Version,
    pub action: Option<String>,
    pub body: Bytes,
}

impl Envelope {
    #[must_use]
    pub const fn is_request(&self) -> bool {
        self.status & status::REQUEST != 0
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.status & status::ERROR != 0
    }

    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.status & status::COMPRESS != 0
    }

    /// Decodes the body into `into` at the envelope version.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if decoding fails or leaves unread bytes.
    pub fn decode_body<T: Streamable + ?Sized>(&self, into: &mut T) -> Result<()> {
        decode_body(&self.body, self.version, into)
    }
}

/// Decodes `body` into `into` and requires every byte to be consumed.
///
/// # Errors
///
/// Returns `Serialization` on malformed input or trailing bytes.
pub fn decode_body<T: Streamable + ?Sized>(body: &[u8], version: Version, into: &mut T) -> Result<()> {
    let mut input = StreamInput::new(body, version);
    into.read_from(&mut input)?;
    if !input.is_exhausted() {
        return Err(TransportError::Serialization(format!(
            "message not fully read: {} trailing bytes",
            input.remaining()
        )));
    }
    Ok(())
}

/// Encodes and decodes envelopes under a compression policy and size limit.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    compression: CompressionConfig,
    max_message_size: usize,
}

impl MessageCodec {
    #[must_use]
    pub const fn new(compression: CompressionConfig, max_message_size: usize) -> Self {
        Self {
            compression,
            max_message_size,
        }
    }

    #[must_use]
    pub const fn compression_config(&self) -> &CompressionConfig {
        &self.compression
    }

    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// # Errors
    ///
    /// Returns a serialization error or `MessageTooLarge`.
    pub fn encode_request(
        &self,
        request_id: u64,
        action: &str,
        message: &dyn Streamable,
        version: Version,
        compress: bool,
    ) -> Result<Bytes> {
        self.encode(
            request_id,
            status::REQUEST,
            version,
            Some(action),
            message,
            compress,
        )
    }

    /// # Errors
    ///
    /// Returns a serialization error or `MessageTooLarge`.
    pub fn encode_response(
        &self,
        request_id: u64,
        message: &dyn Streamable,
        version: Version,
        compress: bool,
    ) -> Result<Bytes> {
        self.encode(request_id, 0, version, None, message, compress)
    }

    /// # Errors
    ///
    /// Returns a serialization error or `MessageTooLarge`.
    pub fn encode_error(&self, request_id: u64, error: &RemoteError, version: Version) -> Result<Bytes> {
        self.encode(request_id, status::ERROR, version, None, error, false)
    }

    fn encode(
        &self,
        request_id: u64,
        mut flags: u8,
        version: Version,
        action: Option<&str>,
        message: &dyn Streamable,
        compress: bool,
    ) -> Result<Bytes> {
        let mut body = StreamOutput::new(version);
        message.write_to(&mut body)?;

        let compressed = if compress && self.compression.applies_to(body.len()) {
            let packed = compression::compress(body.as_slice(), self.compression.method);
            compression::is_beneficial(body.len(), packed.len()).then_some(packed)
        } else {
            None
        };
        if compressed.is_some() {
            flags |= status::COMPRESS;
        }

        let action_len = action.map_or(0, |a| a.len() + 5);
        let body_len = compressed.as_ref().map_or(body.len(), Vec::len);
        let mut frame = StreamOutput::with_capacity(version, HEADER_LEN + action_len + body_len);
        frame.write_u64(request_id);
        frame.write_u8(flags);
        frame.write_u32(version.id());
        if let Some(action) = action {
            frame.write_string(action);
        }
        match &compressed {
            Some(packed) => frame.write_raw(packed),
            None => frame.write_raw(body.as_slice()),
        }

        if frame.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max_size: self.max_message_size,
            });
        }
        Ok(frame.into_bytes())
    }

    /// Parses the header and decompresses the body.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFrame` for short frames or reserved status bits,
    /// `MessageTooLarge`, or a compression error.
    pub fn decode(&self, frame: Bytes) -> Result<Envelope> {
        if frame.len() < HEADER_LEN {
            return Err(TransportError::InvalidFrame(format!(
                "frame of {} bytes is shorter than the {HEADER_LEN} byte header",
                frame.len()
            )));
        }
        if frame.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max_size: self.max_message_size,
            });
        }

        let mut header = StreamInput::new(&frame, Version::V_0);
        let request_id = header.read_u64()?;
        let flags = header.read_u8()?;
        if flags & status::RESERVED != 0 {
            return Err(TransportError::InvalidFrame(format!(
                "reserved status bits set: {flags:#04x}"
            )));
        }
        let version = Version::from_id(header.read_u32()?);
        let action = if flags & status::REQUEST != 0 {
            Some(header.read_string()?)
        } else {
            None
        };
        let offset = frame.len() - header.remaining();
        let raw_body = frame.slice(offset..);

        let body = if flags & status::COMPRESS != 0 {
            let method = match self.compression.method {
                CompressionMethod::None => CompressionMethod::Lz4,
                method => method,
            };
            let decompressed = compression::decompress(&raw_body, method)?;
            if decompressed.len() > self.max_message_size {
                return Err(TransportError::MessageTooLarge {
                    size: decompressed.len(),
                    max_size: self.max_message_size,
                });
            }
            Bytes::from(decompressed)
        } else {
            raw_body
        };

        Ok(Envelope {
            request_id,
            status: flags,
            version,
            action,
            body,
        })
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(CompressionConfig::default(), 100 * 1024 * 1024)
    }
}
