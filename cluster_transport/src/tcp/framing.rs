// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-delimited framing for the TCP transport.
//!
//! ```text
//! +------------------+---------------------+
//! | Length (4B BE)   | Payload             |
//! +------------------+---------------------+
//! ```
//!
//! The payload of the first frame in each direction is a bincode
//! [`Handshake`]. Every later payload is an opaque envelope produced by the
//! message codec.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{
    error::{Result, TransportError},
    node::Version,
};

/// Saturating conversion from `Duration` milliseconds to `u64`.
fn timeout_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Convert a byte length to a 4-byte big-endian length prefix.
fn length_prefix(len: usize, max: usize) -> Result<[u8; 4]> {
    let n = u32::try_from(len).map_err(|_| TransportError::MessageTooLarge {
        size: len,
        max_size: max,
    })?;
    Ok(n.to_be_bytes())
}

/// Length-delimited codec for opaque frames.
#[derive(Debug, Clone, Copy)]
pub struct LengthDelimitedCodec {
    max_frame_length: usize,
}

impl LengthDelimitedCodec {
    #[must_use]
    pub const fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    #[must_use]
    pub const fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// # Errors
    ///
    /// Returns `MessageTooLarge` if the payload exceeds the max frame length.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.max_frame_length {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max_size: self.max_frame_length,
            });
        }
        let header = length_prefix(payload.len(), self.max_frame_length)?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Read one frame. Returns `None` on graceful connection close.
    ///
    /// # Errors
    ///
    /// Returns `MessageTooLarge`, `InvalidFrame`, or an I/O error.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; 4];
        match reader.read_exact(&mut length_buf).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(length_buf) as usize;

        if length > self.max_frame_length {
            return Err(TransportError::MessageTooLarge {
                size: length,
                max_size: self.max_frame_length,
            });
        }

        if length == 0 {
            return Err(TransportError::InvalidFrame("zero-length frame".to_string()));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        Ok(Some(Bytes::from(payload)))
    }

    /// Write one frame with timeout.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `MessageTooLarge`, or an I/O error.
    pub async fn write_frame_with_timeout<W>(
        &self,
        writer: &mut W,
        payload: &[u8],
        io_timeout: Duration,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(payload)?;
        timeout(io_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "write frame",
                timeout_ms: timeout_ms(io_timeout),
            })??;
        timeout(io_timeout, writer.flush())
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "flush",
                timeout_ms: timeout_ms(io_timeout),
            })??;
        Ok(())
    }
}

/// First frame exchanged on every connection, in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Sender's node id.
    pub node_id: String,
    /// Sender's message version.
    pub version: u32,
    /// Framing protocol version.
    pub protocol_version: u32,
}

impl Handshake {
    /// Current framing protocol version.
    pub const PROTOCOL_VERSION: u32 = 1;

    pub fn new(node_id: impl Into<String>, version: Version) -> Self {
        Self {
            node_id: node_id.into(),
            version: version.id(),
            protocol_version: Self::PROTOCOL_VERSION,
        }
    }

    #[must_use]
    pub const fn message_version(&self) -> Version {
        Version::from_id(self.version)
    }

    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let header = length_prefix(payload.len(), usize::MAX)?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// # Errors
    ///
    /// Returns `Handshake` if the payload is too large, deserialization
    /// fails, or the protocol version is unsupported.
    pub async fn read_from<R>(reader: &mut R, max_size: usize) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; 4];
        reader.read_exact(&mut length_buf).await?;
        let length = u32::from_be_bytes(length_buf) as usize;

        if length > max_size {
            return Err(TransportError::Handshake(format!(
                "handshake too large: {length} bytes"
            )));
        }

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;

        let handshake: Self = bincode::deserialize(&payload)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        if handshake.protocol_version != Self::PROTOCOL_VERSION {
            return Err(TransportError::Handshake(format!(
                "unsupported protocol version: {} (supported: {})",
                handshake.protocol_version,
                Self::PROTOCOL_VERSION
            )));
        }

        Ok(handshake)
    }

    /// # Errors
    ///
    /// Returns `Timeout`, a serialization error, or an I/O error.
    pub async fn write_to_with_timeout<W>(&self, writer: &mut W, io_timeout: Duration) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode()?;
        timeout(io_timeout, async {
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "handshake write",
            timeout_ms: timeout_ms(io_timeout),
        })??;
        Ok(())
    }
}
