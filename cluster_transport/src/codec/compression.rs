//! Message body compression.
//!
//! Compression wraps the encoded body only; field layout is unaffected and
//! decompression always happens before any field is decoded.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Compression method used for message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionMethod {
    None,
    /// LZ4 with a prepended little-endian size.
    #[default]
    Lz4,
}

/// Configuration for message body compression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub method: CompressionMethod,
    /// Bodies smaller than this are sent uncompressed even when requested.
    #[serde(default)]
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            method: CompressionMethod::Lz4,
            min_size: 0,
        }
    }
}

impl CompressionConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            method: CompressionMethod::None,
            min_size: 0,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Whether a body of `len` bytes should be compressed when the sender
    /// asked for compression.
    #[must_use]
    pub fn applies_to(&self, len: usize) -> bool {
        self.method != CompressionMethod::None && len >= self.min_size
    }
}

/// Maximum decompressed body size (256 MB).
/// Checked against the size prefix before allocating.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024 * 1024;

#[must_use]
pub fn compress(data: &[u8], method: CompressionMethod) -> Vec<u8> {
    match method {
        CompressionMethod::None => data.to_vec(),
        CompressionMethod::Lz4 => lz4_flex::compress_prepend_size(data),
    }
}

/// # Errors
///
/// Returns `Compression` if the size prefix is missing or too large, or the
/// LZ4 block is corrupt.
pub fn decompress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Lz4 => {
            if data.len() < 4 {
                return Err(TransportError::Compression {
                    operation: "decompress",
                    message: "LZ4 data too short for size prefix".to_string(),
                });
            }

            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSED_SIZE {
                return Err(TransportError::Compression {
                    operation: "decompress",
                    message: format!(
                        "claimed decompressed size {claimed_size} exceeds maximum {MAX_DECOMPRESSED_SIZE}"
                    ),
                });
            }

            lz4_flex::decompress_size_prepended(data).map_err(|e| TransportError::Compression {
                operation: "decompress",
                message: e.to_string(),
            })
        },
    }
}

#[must_use]
pub fn is_beneficial(original_len: usize, compressed_len: usize) -> bool {
    compressed_len < original_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress_lz4() {
        let data = b"Hello, this is a test string that should compress well. ".repeat(10);
        let compressed = compress(&data, CompressionMethod::Lz4);
        assert!(is_beneficial(data.len(), compressed.len()));
        let decompressed = decompress(&compressed, CompressionMethod::Lz4).unwrap();
        assert_eq!(data.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_none_is_identity() {
        let data = b"uncompressed data";
        assert_eq!(compress(data, CompressionMethod::None), data.to_vec());
        assert_eq!(
            decompress(data, CompressionMethod::None).unwrap(),
            data.to_vec()
        );
    }

    #[test]
    fn test_decompress_too_short() {
        let result = decompress(&[1, 2], CompressionMethod::Lz4);
        assert!(matches!(
            result,
            Err(TransportError::Compression {
                operation: "decompress",
                ..
            })
        ));
    }

    #[test]
    fn test_decompress_rejects_oversized_claim() {
        let mut data = u32::MAX.to_le_bytes().to_vec();
        data.extend_from_slice(&[0u8; 8]);
        let err = decompress(&data, CompressionMethod::Lz4).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_applies_to_min_size() {
        let config = CompressionConfig::default().with_min_size(64);
        assert!(!config.applies_to(10));
        assert!(config.applies_to(64));
        assert!(!CompressionConfig::disabled().applies_to(1024));
    }
}
