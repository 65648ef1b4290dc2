//! TCP transport engine.
//!
//! # Architecture
//!
//! ```text
//! TcpTransport
//!   ├── Listener (accept incoming, handshake as acceptor)
//!   ├── TcpChannel (per connection)
//!   │     ├── reader task -> InboundSink
//!   │     └── writer task <- unbounded send queue
//!   └── Framing (length-delimited codec + handshake)
//! ```
//!
//! # Wire Protocol
//!
//! ```text
//! +------------------+-----------------------------------+
//! | Length (4B BE)   | Handshake (bincode) | Envelope    |
//! +------------------+-----------------------------------+
//! ```
//!
//! The first frame each side sends is its handshake: node id, message
//! version and framing protocol version. A full connect rejects a peer
//! whose id differs from the one it dialed.
//!
//! # Example
//!
//! ```ignore
//! use cluster_transport::{tcp::TcpTransportConfig, TransportService, TransportSettings, Version};
//!
//! let config = TcpTransportConfig::new("127.0.0.1:0".parse()?);
//! let service = TransportService::tcp(TransportSettings::new("node1"), Version::CURRENT, config)?;
//! let local = service.start().await?;
//! ```

pub mod config;
pub mod framing;
pub mod transport;

pub use config::TcpTransportConfig;
pub use framing::{Handshake, LengthDelimitedCodec};
pub use transport::TcpTransport;
