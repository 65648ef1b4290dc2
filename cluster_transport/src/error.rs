// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for cluster_transport.

use thiserror::Error;

use crate::{codec::RemoteError, node::NodeId};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations.
///
/// Per-request failures are delivered to exactly one response handler and
/// may also be returned synchronously from `send_request`, so the type is
/// `Clone`.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Peer unreachable, handshake rejected, or vetoed by a fault rule.
    #[error("[{node}] connect failed: {reason}")]
    Connect { node: NodeId, reason: String },

    /// The request could not be handed to the connection.
    #[error("[{node}][{action}] failed to send request: {source}")]
    SendRequest {
        node: NodeId,
        action: String,
        #[source]
        source: Box<TransportError>,
    },

    /// No live connection to the target node.
    #[error("[{node}] node not connected")]
    NodeNotConnected { node: NodeId },

    /// The connection closed while the request was pending.
    #[error("[{node}][{action}] node disconnected")]
    NodeDisconnected { node: NodeId, action: String },

    /// The remote handler failed; the remote error is the source.
    #[error("[{node}][{action}] remote handler failed")]
    RemoteTransport {
        node: NodeId,
        action: String,
        #[source]
        source: RemoteError,
    },

    /// No response arrived within the request timeout.
    #[error("[{node}][{action}] request_id [{request_id}] timed out after [{timeout_ms}ms]")]
    ReceiveTimeout {
        node: NodeId,
        action: String,
        request_id: u64,
        timeout_ms: u64,
    },

    /// Inbound request named an action with no registered handler.
    #[error("no handler found for action [{0}]")]
    ActionNotFound(String),

    #[error("handler for action [{0}] is already registered")]
    DuplicateHandler(String),

    #[error("unknown executor category [{0}]")]
    UnknownExecutor(String),

    #[error("response already sent for request_id [{0}]")]
    ResponseAlreadySent(u64),

    #[error("transport stopped")]
    Stopped,

    #[error("channel closed")]
    ChannelClosed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("message too large: {size} bytes (max {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("compression error during {operation}: {message}")]
    Compression {
        operation: &'static str,
        message: String,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TransportError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReceiveTimeout { .. })
    }

    #[must_use]
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteTransport { .. })
    }

    /// The remote error carried by a `RemoteTransport` failure.
    #[must_use]
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Self::RemoteTransport { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Innermost transport error, following `SendRequest` wrapping.
    #[must_use]
    pub fn root_cause(&self) -> &TransportError {
        match self {
            Self::SendRequest { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
