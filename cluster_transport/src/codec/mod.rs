// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioned message codec.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +------------------+     +------------------+
//! |   Streamable     | --> |  StreamOutput    | --> |  MessageCodec    |
//! | (message fields) |     | (version gated)  |     | (envelope, LZ4)  |
//! +------------------+     +------------------+     +------------------+
//! ```
//!
//! Messages declare fields with the version they first appeared in (see
//! [`versioned_message!`](crate::versioned_message)). A field is written
//! iff the connection version is on or after its declared version, and the
//! reader applies the same check, so peers on different versions stay in
//! agreement about which fields are on the wire.

pub mod compression;
pub mod envelope;
pub mod message;
pub mod stream;

pub use compression::{CompressionConfig, CompressionMethod};
pub use envelope::{decode_body, Envelope, MessageCodec};
pub use message::{EmptyMessage, RemoteError, Streamable, StringMessage};
pub use stream::{StreamInput, StreamOutput, WireValue};
