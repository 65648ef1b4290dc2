// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-flight request table.
//!
//! Every terminal path for a request (response, error response, timeout,
//! connection close, shutdown) goes through [`PendingRequests::claim`],
//! which removes the entry. Whoever removes it owns delivery; every later
//! attempt finds nothing and does nothing. The response handler is consumed
//! by delivery, so a second outcome cannot be produced for the same id.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::{
    codec::{Envelope, RemoteError},
    error::TransportError,
    executor::TaskExecutor,
    node::NodeDescriptor,
    options::RequestOptions,
    response::{ErasedResponseHandler, ResponseOutcome},
    timeout::TimeoutHandle,
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique request id.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// How many timed-out requests are remembered for late-response logging.
const TIMED_OUT_LOG_CAPACITY: usize = 100;

/// Terminal event for a pending request.
#[derive(Debug)]
pub(crate) enum Completion {
    /// A response frame, success or error.
    Response(Envelope),
    Failed(TransportError),
    TimedOut,
}

/// An outbound request awaiting its outcome.
pub struct PendingRequest {
    request_id: u64,
    node: NodeDescriptor,
    action: String,
    handler: Box<dyn ErasedResponseHandler>,
    timeout: Option<TimeoutHandle>,
    sent_at: Instant,
    options: RequestOptions,
}

impl PendingRequest {
    pub(crate) fn new(
        request_id: u64,
        node: NodeDescriptor,
        action: impl Into<String>,
        handler: Box<dyn ErasedResponseHandler>,
        options: RequestOptions,
    ) -> Self {
        Self {
            request_id,
            node,
            action: action.into(),
            handler,
            timeout: None,
            sent_at: Instant::now(),
            options,
        }
    }

    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }

    #[must_use]
    pub const fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub const fn sent_at(&self) -> Instant {
        self.sent_at
    }

    #[must_use]
    pub const fn options(&self) -> &RequestOptions {
        &self.options
    }

    fn outcome(&self, completion: Completion) -> ResponseOutcome {
        match completion {
            Completion::Response(envelope) if envelope.is_error() => {
                let mut remote = RemoteError::default();
                match envelope.decode_body(&mut remote) {
                    Ok(()) => ResponseOutcome::Failed(TransportError::RemoteTransport {
                        node: self.node.id.clone(),
                        action: self.action.clone(),
                        source: remote,
                    }),
                    Err(e) => ResponseOutcome::Failed(e),
                }
            },
            Completion::Response(envelope) => ResponseOutcome::Body(envelope),
            Completion::Failed(error) => ResponseOutcome::Failed(error),
            Completion::TimedOut => ResponseOutcome::Failed(TransportError::ReceiveTimeout {
                node: self.node.id.clone(),
                action: self.action.clone(),
                request_id: self.request_id,
                timeout_ms: self
                    .options
                    .timeout
                    .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            }),
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id)
            .field("node", &self.node.id)
            .field("action", &self.action)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A request whose timeout already fired.
#[derive(Debug, Clone)]
pub struct TimedOutRequest {
    pub request_id: u64,
    pub action: String,
    pub node: NodeDescriptor,
    pub sent_at: Instant,
    pub timed_out_at: Instant,
}

impl TimedOutRequest {
    /// Time between sending and the timeout firing.
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.timed_out_at.duration_since(self.sent_at)
    }
}

/// Concurrent table of in-flight requests.
pub struct PendingRequests {
    entries: DashMap<u64, PendingRequest>,
    executor: Arc<dyn TaskExecutor>,
    timed_out: Mutex<VecDeque<TimedOutRequest>>,
}

impl PendingRequests {
    #[must_use]
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            entries: DashMap::new(),
            executor,
            timed_out: Mutex::new(VecDeque::with_capacity(TIMED_OUT_LOG_CAPACITY)),
        }
    }

    pub(crate) fn register(&self, entry: PendingRequest) {
        let previous = self.entries.insert(entry.request_id, entry);
        debug_assert!(previous.is_none(), "request id reused while pending");
    }

    /// Attaches a timeout to a still-pending request. If the request already
    /// completed, the timeout is cancelled and `false` returned.
    pub(crate) fn attach_timeout(&self, request_id: u64, handle: TimeoutHandle) -> bool {
        if let Some(mut entry) = self.entries.get_mut(&request_id) {
            entry.timeout = Some(handle);
            return true;
        }
        handle.cancel();
        false
    }

    /// Removes the entry for `request_id`. Only the first caller gets it.
    pub fn claim(&self, request_id: u64) -> Option<PendingRequest> {
        self.entries.remove(&request_id).map(|(_, entry)| entry)
    }

    /// Claims `request_id` and delivers `completion` to its handler.
    /// Returns `false` if another path already claimed it.
    pub(crate) fn complete(&self, request_id: u64, completion: Completion) -> bool {
        match self.claim(request_id) {
            Some(entry) => {
                self.deliver(entry, completion);
                true
            },
            None => false,
        }
    }

    /// Claims every request pending against `node_id`.
    pub fn cancel_on_connection_close(&self, node_id: &str) -> Vec<PendingRequest> {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|entry| entry.node.id == node_id)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter().filter_map(|id| self.claim(id)).collect()
    }

    /// Claims every pending request.
    pub fn drain(&self) -> Vec<PendingRequest> {
        let ids: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter_map(|id| self.claim(id)).collect()
    }

    /// Delivers `completion` for a claimed entry on its handler's executor.
    pub(crate) fn deliver(&self, mut entry: PendingRequest, completion: Completion) {
        if let Some(timeout) = entry.timeout.take() {
            timeout.cancel();
        }
        if matches!(completion, Completion::TimedOut) {
            self.remember_timed_out(&entry);
        }

        let outcome = entry.outcome(completion);
        let request_id = entry.request_id;
        let category = entry.handler.executor().to_string();
        let slot = Arc::new(Mutex::new(Some((entry.handler, outcome))));

        let task_slot = slot.clone();
        let submitted = self.executor.execute(
            &category,
            Box::new(move || {
                let taken = task_slot.lock().take();
                if let Some((handler, outcome)) = taken {
                    invoke(request_id, handler, outcome);
                }
            }),
        );

        if let Err(e) = submitted {
            tracing::warn!(
                request_id,
                executor = %category,
                error = %e,
                "response executor rejected delivery, delivering inline"
            );
            let taken = slot.lock().take();
            if let Some((handler, outcome)) = taken {
                invoke(request_id, handler, outcome);
            }
        }
    }

    fn remember_timed_out(&self, entry: &PendingRequest) {
        let mut log = self.timed_out.lock();
        if log.len() == TIMED_OUT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(TimedOutRequest {
            request_id: entry.request_id,
            action: entry.action.clone(),
            node: entry.node.clone(),
            sent_at: entry.sent_at,
            timed_out_at: Instant::now(),
        });
    }

    /// Removes and returns the record of a timed-out request, if remembered.
    pub fn take_timed_out(&self, request_id: u64) -> Option<TimedOutRequest> {
        let mut log = self.timed_out.lock();
        let index = log.iter().position(|r| r.request_id == request_id)?;
        log.remove(index)
    }

    #[must_use]
    pub fn contains(&self, request_id: u64) -> bool {
        self.entries.contains_key(&request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn invoke(request_id: u64, handler: Box<dyn ErasedResponseHandler>, outcome: ResponseOutcome) {
    if catch_unwind(AssertUnwindSafe(|| handler.deliver(outcome))).is_err() {
        tracing::warn!(request_id, "response handler panicked");
    }
}
