//! Cluster Transport - request/response RPC between cluster nodes
//!
//! Nodes exchange typed request and response messages over pluggable byte
//! transports:
//! - Messages encode field-by-field, gated by the negotiated wire version
//! - Every request completes exactly once: response, error, timeout or disconnect
//! - Handlers run on named executors, responses on the caller's choice
//! - Tracing filters and fault rules can change while the service runs
//!
//! # Architecture
//!
//! ```text
//! TransportService
//!   ├── ConnectionRegistry (one connection per node, listener events)
//!   ├── HandlerRegistry (action -> request handler + executor)
//!   ├── PendingRequests (request id -> response handler, exactly-once)
//!   ├── TimeoutScheduler (per-request timers)
//!   ├── TracerHub (include/exclude glob filters)
//!   ├── FaultInjector (simulated disconnects and unresponsive nodes)
//!   ├── MessageCodec (envelope, versioned body, lz4 compression)
//!   └── Transport
//!         ├── LocalTransport (in-process)
//!         └── TcpTransport (length-delimited frames + handshake)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use cluster_transport::{
//!     executor::names, RequestOptions, StringMessage, TransportService, TransportSettings, Version,
//! };
//!
//! let service = TransportService::local(TransportSettings::new("node1"), Version::CURRENT)?;
//! service.register_handler_fn("sayHello", names::GENERIC, |req: StringMessage, channel| {
//!     channel.send_response(&StringMessage::new(format!("hello {}", req.message)))?;
//!     Ok(())
//! })?;
//! let local = service.start().await?;
//!
//! service.connect_to_node(&peer).await?;
//! let reply: StringMessage = service
//!     .submit_request(&peer, "sayHello", &StringMessage::new("moshe"), RequestOptions::new())
//!     .await?;
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod executor;
pub mod fault;
pub mod handler;
pub mod local;
pub mod node;
pub mod options;
pub mod pending;
pub mod response;
pub mod service;
pub mod settings;
pub mod stats;
pub mod tcp;
pub mod timeout;
pub mod tracer;
pub mod transport;

// Re-exports
pub use channel::TransportChannel;
pub use codec::{
    CompressionConfig, CompressionMethod, EmptyMessage, Envelope, MessageCodec, RemoteError,
    StreamInput, StreamOutput, Streamable, StringMessage, WireValue,
};
pub use connection::{Connection, ConnectionListener, ConnectionRegistry, ConnectionState};
pub use error::{Result, TransportError};
pub use executor::{TaskExecutor, ThreadPool};
pub use fault::{FaultInjector, FaultRule, SendDecision};
pub use handler::{HandlerError, HandlerFn, HandlerRegistry, HandlerResult, RequestHandler};
pub use local::LocalTransport;
pub use node::{NodeDescriptor, NodeId, TransportAddress, Version};
pub use options::{RequestOptions, ResponseOptions};
pub use pending::{PendingRequest, PendingRequests, TimedOutRequest};
pub use response::{ResponseHandler, TransportFuture};
pub use service::TransportService;
pub use settings::{TraceSettings, TransportSettings};
pub use stats::{TransportStats, TransportStatsSnapshot};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use timeout::{TimeoutHandle, TimeoutScheduler};
pub use tracer::{TraceFilter, Tracer, TracerHub};
pub use transport::{Channel, ConnectMode, InboundSink, LocalIdentity, Transport};
