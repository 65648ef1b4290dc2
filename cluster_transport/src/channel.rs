// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler-side response channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    codec::{MessageCodec, RemoteError, Streamable},
    error::{Result, TransportError},
    node::{NodeId, TransportAddress, Version},
    options::ResponseOptions,
    stats::TransportStats,
    tracer::TracerHub,
    transport::Channel,
};

/// Service state a response needs.
pub(crate) struct ResponseContext {
    pub(crate) node_id: NodeId,
    pub(crate) codec: MessageCodec,
    pub(crate) tracer: Arc<TracerHub>,
    pub(crate) stats: Arc<TransportStats>,
}

struct ChannelState {
    request_id: u64,
    action: String,
    version: Version,
    channel: Arc<dyn Channel>,
    context: Arc<ResponseContext>,
    responded: AtomicBool,
}

/// Channel a request handler answers on.
///
/// Responses are encoded at the version of the request envelope, which is
/// the version negotiated for the connection the request arrived on. At
/// most one response, success or error, is sent per request.
#[derive(Clone)]
pub struct TransportChannel {
    state: Arc<ChannelState>,
}

impl TransportChannel {
    pub(crate) fn new(
        request_id: u64,
        action: impl Into<String>,
        version: Version,
        channel: Arc<dyn Channel>,
        context: Arc<ResponseContext>,
    ) -> Self {
        Self {
            state: Arc::new(ChannelState {
                request_id,
                action: action.into(),
                version,
                channel,
                context,
                responded: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.state.action
    }

    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.state.request_id
    }

    /// Version responses on this channel are encoded at.
    #[must_use]
    pub fn version(&self) -> Version {
        self.state.version
    }

    /// Address the request came from.
    #[must_use]
    pub fn remote_address(&self) -> TransportAddress {
        self.state.channel.remote_address()
    }

    #[must_use]
    pub fn has_responded(&self) -> bool {
        self.state.responded.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<()> {
        if self.state.responded.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ResponseAlreadySent(self.state.request_id));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `ResponseAlreadySent`, an encoding error, or `ChannelClosed`.
    pub fn send_response(&self, response: &dyn Streamable) -> Result<()> {
        self.send_response_with(response, ResponseOptions::default())
    }

    /// # Errors
    ///
    /// Returns `ResponseAlreadySent`, an encoding error, or `ChannelClosed`.
    /// If encoding fails, an error response is sent in its place.
    pub fn send_response_with(
        &self,
        response: &dyn Streamable,
        options: ResponseOptions,
    ) -> Result<()> {
        self.claim()?;
        let state = &self.state;
        let frame = match state.context.codec.encode_response(
            state.request_id,
            response,
            state.version,
            options.compress,
        ) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    request_id = state.request_id,
                    action = %state.action,
                    error = %e,
                    "failed to encode response"
                );
                let _ = self.write_error(RemoteError::new("serialization", e.to_string()));
                return Err(e);
            },
        };

        let len = frame.len();
        state.channel.send(frame)?;
        TransportStats::incr(&state.context.stats.responses_sent);
        TransportStats::add(&state.context.stats.bytes_sent, len);
        state
            .context
            .tracer
            .response_sent(state.request_id, &state.action);
        Ok(())
    }

    /// Sends `error` back to the caller as the outcome of the request.
    ///
    /// # Errors
    ///
    /// Returns `ResponseAlreadySent`, an encoding error, or `ChannelClosed`.
    pub fn send_error(&self, error: RemoteError) -> Result<()> {
        self.claim()?;
        self.write_error(error)
    }

    fn write_error(&self, mut error: RemoteError) -> Result<()> {
        let state = &self.state;
        if error.node.is_empty() {
            error.node = state.context.node_id.clone();
        }
        if error.action.is_empty() {
            error.action = state.action.clone();
        }
        let frame = state
            .context
            .codec
            .encode_error(state.request_id, &error, state.version)?;
        let len = frame.len();
        state.channel.send(frame)?;
        TransportStats::incr(&state.context.stats.errors_sent);
        TransportStats::add(&state.context.stats.bytes_sent, len);
        state
            .context
            .tracer
            .error_sent(state.request_id, &state.action, &error);
        Ok(())
    }
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("request_id", &self.state.request_id)
            .field("action", &self.state.action)
            .field("version", &self.state.version)
            .finish_non_exhaustive()
    }
}
