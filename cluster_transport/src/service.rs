// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transport service façade.
//!
//! [`TransportService`] ties the pieces together: it owns the connection and
//! handler registries, the pending-request table and the tracer, encodes
//! outbound requests at each connection's negotiated version, and dispatches
//! inbound frames handed up by the byte transport.
//!
//! Request flow:
//!
//! ```text
//! send_request ─> PendingRequests::register ─> arm timeout ─> encode ─> Channel::send
//!                          │
//!   response frame ───> claim ─┬─> deliver to ResponseHandler (exactly once)
//!   timeout fires ────> claim ─┤
//!   channel closed ───> claim ─┘
//! ```

use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    channel::{ResponseContext, TransportChannel},
    codec::{Envelope, MessageCodec, RemoteError, Streamable},
    connection::{ConnectionListener, ConnectionRegistry},
    error::{Result, TransportError},
    executor::{TaskExecutor, ThreadPool},
    fault::{FaultInjector, SendDecision},
    handler::{HandlerFn, HandlerRegistry, HandlerResult, Invocation, RequestHandler},
    local::LocalTransport,
    node::{NodeDescriptor, NodeId, Version},
    options::RequestOptions,
    pending::{next_request_id, Completion, PendingRequest, PendingRequests},
    response::{
        erase, ErasedResponseHandler, ForwardingResponseHandler, FutureResponseHandler,
        ResponseHandler, TransportFuture,
    },
    settings::TransportSettings,
    stats::{TransportStats, TransportStatsSnapshot},
    tcp::{TcpTransport, TcpTransportConfig},
    timeout::TimeoutScheduler,
    tracer::{TraceFilter, Tracer, TracerHub},
    transport::{Channel, ConnectMode, InboundSink, LocalIdentity, Transport},
};

/// Remote error types produced by the dispatch path.
pub mod error_types {
    pub const ACTION_NOT_FOUND: &str = "action_not_found";
    pub const SERIALIZATION: &str = "serialization";
    pub const HANDLER_FAILURE: &str = "handler_failure";
    pub const PANIC: &str = "panic";
    pub const EXECUTOR_REJECTED: &str = "executor_rejected";
}

const INITIALIZED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

struct ServiceInner {
    node_name: NodeId,
    version: Version,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn TaskExecutor>,
    scheduler: TimeoutScheduler,
    responses: Arc<ResponseContext>,
    local_node: OnceLock<NodeDescriptor>,
    connections: ConnectionRegistry,
    handlers: HandlerRegistry,
    pending: PendingRequests,
    faults: FaultInjector,
    lifecycle: AtomicU8,
    compress_default: AtomicBool,
    connect_timeout: Duration,
}

/// Request/response transport for one node.
///
/// Cheap to clone; clones share the same service.
#[derive(Clone)]
pub struct TransportService {
    inner: Arc<ServiceInner>,
}

impl TransportService {
    /// Creates a service over `transport`, running handler bodies and
    /// response deliveries on `executor`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings or when called outside a tokio
    /// runtime.
    pub fn new(
        settings: TransportSettings,
        version: Version,
        transport: Arc<dyn Transport>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        settings.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Config(format!("no tokio runtime: {e}")))?;

        let tracer = Arc::new(TracerHub::new(settings.trace_filter()));
        let responses = Arc::new(ResponseContext {
            node_id: settings.node_name.clone(),
            codec: MessageCodec::new(settings.compression.clone(), settings.max_message_size),
            tracer,
            stats: Arc::new(TransportStats::default()),
        });

        Ok(Self {
            inner: Arc::new(ServiceInner {
                node_name: settings.node_name.clone(),
                version,
                transport,
                pending: PendingRequests::new(executor.clone()),
                executor,
                scheduler: TimeoutScheduler::new(runtime),
                responses,
                local_node: OnceLock::new(),
                connections: ConnectionRegistry::new(),
                handlers: HandlerRegistry::new(),
                faults: FaultInjector::new(),
                lifecycle: AtomicU8::new(INITIALIZED),
                compress_default: AtomicBool::new(settings.compress),
                connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            }),
        })
    }

    /// Service over an in-process [`LocalTransport`] with the default pool.
    ///
    /// # Errors
    ///
    /// See [`TransportService::new`].
    pub fn local(settings: TransportSettings, version: Version) -> Result<Self> {
        let executor = Arc::new(ThreadPool::current()?);
        Self::new(settings, version, Arc::new(LocalTransport::new()), executor)
    }

    /// Service over a [`TcpTransport`] with the default pool.
    ///
    /// # Errors
    ///
    /// See [`TransportService::new`].
    pub fn tcp(settings: TransportSettings, version: Version, config: TcpTransportConfig) -> Result<Self> {
        let executor = Arc::new(ThreadPool::current()?);
        Self::new(settings, version, Arc::new(TcpTransport::new(config)), executor)
    }

    // ========== Lifecycle ==========

    /// Binds the transport and returns this node's descriptor.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after [`stop`](Self::stop), or the transport's
    /// bind failure.
    pub async fn start(&self) -> Result<NodeDescriptor> {
        let inner = &self.inner;
        if inner.lifecycle.load(Ordering::SeqCst) == STOPPED {
            return Err(TransportError::Stopped);
        }
        if let Some(node) = inner.local_node.get() {
            return Ok(node.clone());
        }

        inner.connections.start();
        let identity = LocalIdentity {
            node_id: inner.node_name.clone(),
            version: inner.version,
        };
        let weak: Weak<ServiceInner> = Arc::downgrade(inner);
        let address = inner.transport.start(identity, weak).await?;

        let node = inner
            .local_node
            .get_or_init(|| NodeDescriptor::new(inner.node_name.clone(), address, inner.version))
            .clone();
        let _ = inner
            .lifecycle
            .compare_exchange(INITIALIZED, STARTED, Ordering::SeqCst, Ordering::SeqCst);
        tracing::debug!(node = %node, "transport service started");
        Ok(node)
    }

    /// Closes every connection, stops the transport and fails all pending
    /// requests with `Stopped`. Later sends are rejected.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.lifecycle.swap(STOPPED, Ordering::SeqCst) == STOPPED {
            return;
        }
        inner.connections.close_all();
        inner.transport.stop().await;

        let drained = inner.pending.drain();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests on stop");
        }
        for entry in drained {
            inner.pending.deliver(entry, Completion::Failed(TransportError::Stopped));
        }
        tracing::debug!(node = %inner.node_name, "transport service stopped");
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.lifecycle.load(Ordering::SeqCst) == STARTED
    }

    /// This node's descriptor, once started.
    #[must_use]
    pub fn local_node(&self) -> Option<NodeDescriptor> {
        self.inner.local_node.get().cloned()
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.inner.version
    }

    // ========== Connections ==========

    /// Connects to `node`, verifying its identity.
    ///
    /// # Errors
    ///
    /// Returns `Connect` if the node is unreachable, a fault rule vetoes the
    /// connect, or the connect times out.
    pub async fn connect_to_node(&self, node: &NodeDescriptor) -> Result<()> {
        self.inner.connect(node, ConnectMode::Full).await
    }

    /// Connects to `node` without verifying its identity.
    ///
    /// # Errors
    ///
    /// Fails the same way as [`connect_to_node`](Self::connect_to_node).
    pub async fn connect_to_node_light(&self, node: &NodeDescriptor) -> Result<()> {
        self.inner.connect(node, ConnectMode::Light).await
    }

    /// Closes the connection to `node`. Pending requests against it fail
    /// with `NodeDisconnected`. Returns `false` if it was not connected.
    pub fn disconnect_from_node(&self, node: &NodeDescriptor) -> bool {
        match self.inner.connections.close(&node.id) {
            Some(connection) => {
                self.inner.fail_pending(connection.node());
                true
            },
            None => false,
        }
    }

    #[must_use]
    pub fn node_connected(&self, node: &NodeDescriptor) -> bool {
        self.inner.connections.is_connected(&node.id)
    }

    /// Negotiated version of the connection to `node`.
    #[must_use]
    pub fn connection_version(&self, node: &NodeDescriptor) -> Option<Version> {
        self.inner.connections.get(&node.id).map(|c| c.version())
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.connections.add_listener(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.inner.connections.remove_listener(listener)
    }

    // ========== Handlers ==========

    /// # Errors
    ///
    /// Returns `UnknownExecutor` if the handler's category is not configured
    /// or `DuplicateHandler` if `action` is taken.
    pub fn register_handler<H: RequestHandler>(&self, action: impl Into<String>, handler: H) -> Result<()> {
        if !self.inner.executor.has_category(handler.executor()) {
            return Err(TransportError::UnknownExecutor(handler.executor().to_string()));
        }
        self.inner.handlers.register(action, handler)
    }

    /// Registers a closure as the handler for `action`.
    ///
    /// # Errors
    ///
    /// See [`register_handler`](Self::register_handler).
    pub fn register_handler_fn<T, F>(
        &self,
        action: impl Into<String>,
        executor: impl Into<String>,
        f: F,
    ) -> Result<()>
    where
        T: Streamable + Default + Send + 'static,
        F: Fn(T, TransportChannel) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_handler(action, HandlerFn::new(executor, f))
    }

    pub fn remove_handler(&self, action: &str) -> bool {
        self.inner.handlers.remove(action)
    }

    #[must_use]
    pub fn has_handler(&self, action: &str) -> bool {
        self.inner.handlers.contains(action)
    }

    // ========== Requests ==========

    /// Sends `request` to `node` and returns its request id.
    ///
    /// The outcome is delivered to `handler` exactly once. When sending
    /// fails synchronously, the error is both returned here and delivered
    /// to `handler`.
    ///
    /// # Errors
    ///
    /// Returns `SendRequest` if the node is not connected, a fault rule
    /// applies or the channel is closed, `Stopped` if the service is not
    /// running, or an encoding error.
    pub fn send_request<H: ResponseHandler>(
        &self,
        node: &NodeDescriptor,
        action: &str,
        request: &dyn Streamable,
        options: RequestOptions,
        handler: H,
    ) -> Result<u64> {
        self.inner.send(node, action, request, options, erase(handler))
    }

    /// Sends `request` and returns a future resolving to the decoded
    /// response or the request's failure.
    pub fn submit_request<T>(
        &self,
        node: &NodeDescriptor,
        action: &str,
        request: &dyn Streamable,
        options: RequestOptions,
    ) -> TransportFuture<T>
    where
        T: Streamable + Default + Send + 'static,
    {
        let (tx, future) = TransportFuture::pair();
        let _ = self.send_request(node, action, request, options, FutureResponseHandler::new(tx));
        future
    }

    /// Like [`submit_request`](Self::submit_request), also forwarding the
    /// outcome to `handler`.
    pub fn submit_request_with<H>(
        &self,
        node: &NodeDescriptor,
        action: &str,
        request: &dyn Streamable,
        options: RequestOptions,
        handler: H,
    ) -> TransportFuture<H::Response>
    where
        H: ResponseHandler,
        H::Response: Clone,
    {
        let (tx, future) = TransportFuture::pair();
        let _ = self.send_request(
            node,
            action,
            request,
            options,
            ForwardingResponseHandler::new(handler, tx),
        );
        future
    }

    /// Number of requests awaiting an outcome.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ========== Tracing and settings ==========

    pub fn add_tracer(&self, tracer: Arc<dyn Tracer>) {
        self.inner.responses.tracer.add(tracer);
    }

    pub fn remove_tracer(&self, tracer: &Arc<dyn Tracer>) -> bool {
        self.inner.responses.tracer.remove(tracer)
    }

    pub fn clear_tracers(&self) {
        self.inner.responses.tracer.clear();
    }

    #[must_use]
    pub fn trace_filter(&self) -> Arc<TraceFilter> {
        self.inner.responses.tracer.filter()
    }

    /// Applies the live-updatable parts of `settings`: trace filters and the
    /// default request compression.
    pub fn apply_settings(&self, settings: &TransportSettings) {
        self.inner.responses.tracer.set_filter(settings.trace_filter());
        self.inner
            .compress_default
            .store(settings.compress, Ordering::SeqCst);
        tracing::debug!(
            include = ?settings.trace.include,
            exclude = ?settings.trace.exclude,
            compress = settings.compress,
            "applied transport settings"
        );
    }

    #[must_use]
    pub fn stats(&self) -> TransportStatsSnapshot {
        self.inner.responses.stats.snapshot()
    }

    // ========== Fault injection ==========

    /// Sends to and connects to `node` fail with a simulated disconnect.
    pub fn add_fail_to_send_no_connect_rule(&self, node: &NodeDescriptor) {
        self.inner.faults.add_fail_to_send_no_connect_rule(node);
    }

    /// Connects to `node` fail; requests over an existing connection are
    /// dropped and only resolve by timeout.
    pub fn add_unresponsive_rule(&self, node: &NodeDescriptor) {
        self.inner.faults.add_unresponsive_rule(node);
    }

    pub fn clear_rule(&self, node: &NodeDescriptor) {
        self.inner.faults.clear_rule(node);
    }

    pub fn clear_all_rules(&self) {
        self.inner.faults.clear_all_rules();
    }

    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }
}

impl std::fmt::Debug for TransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportService")
            .field("node", &self.inner.node_name)
            .field("version", &self.inner.version)
            .field("lifecycle", &self.inner.lifecycle.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ServiceInner {
    fn ensure_started(&self) -> Result<()> {
        match self.lifecycle.load(Ordering::SeqCst) {
            STARTED => Ok(()),
            _ => Err(TransportError::Stopped),
        }
    }

    async fn connect(&self, node: &NodeDescriptor, mode: ConnectMode) -> Result<()> {
        self.ensure_started()?;
        let attempt = self.connections.connect(
            node,
            mode,
            self.transport.as_ref(),
            &self.faults,
            self.version,
            |stale| self.fail_pending(stale.node()),
        );
        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(TransportError::Connect {
                node: node.id.clone(),
                reason: format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ),
            }),
        }
    }

    fn send(
        self: &Arc<Self>,
        node: &NodeDescriptor,
        action: &str,
        request: &dyn Streamable,
        options: RequestOptions,
        handler: Box<dyn ErasedResponseHandler>,
    ) -> Result<u64> {
        let request_id = next_request_id();
        self.pending.register(PendingRequest::new(
            request_id,
            node.clone(),
            action,
            handler,
            options,
        ));

        if let Some(delay) = options.timeout {
            let weak = Arc::downgrade(self);
            let handle = self.scheduler.schedule(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timeout(request_id);
                }
            });
            self.pending.attach_timeout(request_id, handle);
        }

        match self.transmit(node, action, request, &options, request_id) {
            Ok(()) => Ok(request_id),
            Err(e) => {
                tracing::debug!(request_id, node = %node.id, action, error = %e, "send failed");
                if let Some(entry) = self.pending.claim(request_id) {
                    self.pending.deliver(entry, Completion::Failed(e.clone()));
                }
                Err(e)
            },
        }
    }

    fn transmit(
        &self,
        node: &NodeDescriptor,
        action: &str,
        request: &dyn Streamable,
        options: &RequestOptions,
        request_id: u64,
    ) -> Result<()> {
        self.ensure_started()?;
        let wrap = |source: TransportError| TransportError::SendRequest {
            node: node.id.clone(),
            action: action.to_string(),
            source: Box::new(source),
        };

        let decision = self.faults.check_send(node).map_err(wrap)?;
        let connection = self.connections.get(&node.id).ok_or_else(|| {
            wrap(TransportError::NodeNotConnected {
                node: node.id.clone(),
            })
        })?;

        let compress = options.compress || self.compress_default.load(Ordering::Relaxed);
        let frame = self.responses.codec.encode_request(
            request_id,
            action,
            request,
            connection.version(),
            compress,
        )?;
        let len = frame.len();
        if decision == SendDecision::Deliver {
            connection.channel().send(frame).map_err(wrap)?;
        }

        TransportStats::incr(&self.responses.stats.requests_sent);
        TransportStats::add(&self.responses.stats.bytes_sent, len);
        self.responses
            .tracer
            .request_sent(node, request_id, action, options);
        Ok(())
    }

    fn on_timeout(&self, request_id: u64) {
        if self.pending.complete(request_id, Completion::TimedOut) {
            TransportStats::incr(&self.responses.stats.timeouts);
            tracing::debug!(request_id, "request timed out");
        }
    }

    fn fail_pending(&self, node: &NodeDescriptor) {
        for entry in self.pending.cancel_on_connection_close(&node.id) {
            let error = TransportError::NodeDisconnected {
                node: node.id.clone(),
                action: entry.action().to_string(),
            };
            self.pending.deliver(entry, Completion::Failed(error));
        }
    }

    fn handle_request(&self, channel: &Arc<dyn Channel>, envelope: Envelope) {
        let action = envelope.action.clone().unwrap_or_default();
        let request_id = envelope.request_id;
        TransportStats::incr(&self.responses.stats.requests_received);
        self.responses.tracer.request_received(request_id, &action);

        let response_channel = TransportChannel::new(
            request_id,
            action.clone(),
            envelope.version,
            channel.clone(),
            self.responses.clone(),
        );

        let Some(handler) = self.handlers.get(&action) else {
            let error = TransportError::ActionNotFound(action);
            respond_with_error(
                &response_channel,
                RemoteError::new(error_types::ACTION_NOT_FOUND, error.to_string()),
            );
            return;
        };

        let category = handler.executor().to_string();
        let invocation = match handler.prepare(&envelope) {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::warn!(request_id, action = %action, error = %e, "failed to decode request");
                respond_with_error(
                    &response_channel,
                    RemoteError::new(error_types::SERIALIZATION, e.to_string()),
                );
                return;
            },
        };

        let task_channel = response_channel.clone();
        let submitted = self.executor.execute(
            &category,
            Box::new(move || run_handler(invocation, task_channel)),
        );
        if let Err(e) = submitted {
            tracing::warn!(request_id, action = %action, executor = %category, error = %e, "handler rejected by executor");
            respond_with_error(
                &response_channel,
                RemoteError::new(error_types::EXECUTOR_REJECTED, e.to_string()),
            );
        }
    }

    fn handle_response(&self, envelope: Envelope) {
        let request_id = envelope.request_id;
        let Some(entry) = self.pending.claim(request_id) else {
            match self.pending.take_timed_out(request_id) {
                Some(timed_out) => {
                    TransportStats::incr(&self.responses.stats.late_responses);
                    tracing::warn!(
                        request_id,
                        action = %timed_out.action,
                        node = %timed_out.node,
                        sent_ms_ago = timed_out.sent_at.elapsed().as_millis() as u64,
                        timed_out_ms_ago = timed_out.timed_out_at.elapsed().as_millis() as u64,
                        "received response for a request that has timed out"
                    );
                },
                None => {
                    tracing::debug!(request_id, "discarding response for unknown request");
                },
            }
            return;
        };

        TransportStats::incr(&self.responses.stats.responses_received);
        self.responses
            .tracer
            .response_received(request_id, entry.node(), entry.action());
        self.pending.deliver(entry, Completion::Response(envelope));
    }
}

impl InboundSink for ServiceInner {
    fn on_frame(&self, channel: &Arc<dyn Channel>, frame: Bytes) {
        TransportStats::add(&self.responses.stats.bytes_received, frame.len());
        let envelope = match self.responses.codec.decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(channel = channel.id(), error = %e, "dropping undecodable frame");
                return;
            },
        };

        if envelope.is_request() {
            self.handle_request(channel, envelope);
        } else {
            self.handle_response(envelope);
        }
    }

    fn on_channel_closed(&self, channel: &Arc<dyn Channel>) {
        if let Some(connection) = self.connections.on_channel_closed(channel.id()) {
            self.fail_pending(connection.node());
        }
    }
}

fn run_handler(invocation: Invocation, channel: TransportChannel) {
    let outcome = catch_unwind(AssertUnwindSafe(|| invocation(channel.clone())));
    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => RemoteError::new(error_types::HANDLER_FAILURE, e.to_string()),
        Err(panic) => RemoteError::new(error_types::PANIC, panic_message(panic.as_ref())),
    };

    if channel.has_responded() {
        tracing::warn!(
            request_id = channel.request_id(),
            action = channel.action(),
            error = %error,
            "handler failed after responding"
        );
        return;
    }
    respond_with_error(&channel, error);
}

fn respond_with_error(channel: &TransportChannel, error: RemoteError) {
    if let Err(e) = channel.send_error(error) {
        tracing::debug!(
            request_id = channel.request_id(),
            action = channel.action(),
            error = %e,
            "failed to send error response"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
