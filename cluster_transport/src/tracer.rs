// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request tracing with live include/exclude filters.
//!
//! The filter and the tracer list are read on every request, so both are
//! kept in [`ArcSwap`] snapshots: readers load without locking and a
//! settings update swaps in a new snapshot atomically.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{
    codec::RemoteError,
    node::NodeDescriptor,
    options::RequestOptions,
};

const TRACE_TARGET: &str = "cluster_transport::tracer";

/// Observer of request lifecycle events. All callbacks default to no-ops.
pub trait Tracer: Send + Sync {
    fn request_sent(
        &self,
        _node: &NodeDescriptor,
        _request_id: u64,
        _action: &str,
        _options: &RequestOptions,
    ) {
    }

    fn request_received(&self, _request_id: u64, _action: &str) {}

    fn response_sent(&self, _request_id: u64, _action: &str) {}

    fn error_sent(&self, _request_id: u64, _action: &str, _error: &RemoteError) {}

    fn response_received(&self, _request_id: u64, _node: &NodeDescriptor, _action: &str) {}
}

/// Glob match supporting `*` wildcards anywhere in the pattern.
#[must_use]
pub fn simple_match(pattern: &str, value: &str) -> bool {
    let Some(first) = pattern.find('*') else {
        return pattern == value;
    };
    if pattern.len() == 1 {
        return true;
    }
    if first == 0 {
        let rest = &pattern[1..];
        let Some(next) = rest.find('*') else {
            return value.ends_with(rest);
        };
        if next == 0 {
            return simple_match(rest, value);
        }
        let part = &rest[..next];
        let step = part.chars().next().map_or(1, char::len_utf8);
        let mut from = 0;
        while let Some(idx) = value[from..].find(part) {
            let after = from + idx + part.len();
            if simple_match(&rest[next..], &value[after..]) {
                return true;
            }
            from += idx + step;
        }
        return false;
    }
    value.len() >= first
        && value.is_char_boundary(first)
        && pattern[..first] == value[..first]
        && simple_match(&pattern[first..], &value[first..])
}

fn match_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| simple_match(p, value))
}

/// Action-name filter. Empty include matches everything; exclude wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TraceFilter {
    /// Empty patterns are ignored.
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        fn clean<X: Into<String>>(items: impl IntoIterator<Item = X>) -> Vec<String> {
            items
                .into_iter()
                .map(Into::into)
                .filter(|s| !s.is_empty())
                .collect()
        }
        Self {
            include: clean(include),
            exclude: clean(exclude),
        }
    }

    #[must_use]
    pub fn include(&self) -> &[String] {
        &self.include
    }

    #[must_use]
    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    #[must_use]
    pub fn should_trace(&self, action: &str) -> bool {
        if !self.include.is_empty() && !match_any(&self.include, action) {
            return false;
        }
        !match_any(&self.exclude, action)
    }
}

/// Fan-out point for tracer events on one service.
///
/// The filter gates the sending side only (`request_sent` and
/// `response_received`). Events for inbound requests always fire.
pub struct TracerHub {
    filter: ArcSwap<TraceFilter>,
    tracers: ArcSwap<Vec<Arc<dyn Tracer>>>,
}

impl TracerHub {
    #[must_use]
    pub fn new(filter: TraceFilter) -> Self {
        Self {
            filter: ArcSwap::from_pointee(filter),
            tracers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn set_filter(&self, filter: TraceFilter) {
        tracing::debug!(
            include = ?filter.include,
            exclude = ?filter.exclude,
            "trace filter updated"
        );
        self.filter.store(Arc::new(filter));
    }

    #[must_use]
    pub fn filter(&self) -> Arc<TraceFilter> {
        self.filter.load_full()
    }

    pub fn add(&self, tracer: Arc<dyn Tracer>) {
        self.tracers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(tracer.clone());
            next
        });
    }

    /// Removes `tracer` by identity. Returns whether it was registered.
    pub fn remove(&self, tracer: &Arc<dyn Tracer>) -> bool {
        let mut removed = false;
        self.tracers.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|t| !Arc::ptr_eq(t, tracer))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn clear(&self) {
        self.tracers.store(Arc::new(Vec::new()));
    }

    fn enabled(&self, action: &str) -> bool {
        self.filter.load().should_trace(action)
    }

    pub fn request_sent(
        &self,
        node: &NodeDescriptor,
        request_id: u64,
        action: &str,
        options: &RequestOptions,
    ) {
        if !self.enabled(action) {
            return;
        }
        tracing::trace!(
            target: TRACE_TARGET,
            request_id,
            action,
            node = %node,
            "sent request"
        );
        for tracer in self.tracers.load().iter() {
            tracer.request_sent(node, request_id, action, options);
        }
    }

    pub fn request_received(&self, request_id: u64, action: &str) {
        tracing::trace!(target: TRACE_TARGET, request_id, action, "received request");
        for tracer in self.tracers.load().iter() {
            tracer.request_received(request_id, action);
        }
    }

    pub fn response_sent(&self, request_id: u64, action: &str) {
        tracing::trace!(target: TRACE_TARGET, request_id, action, "sent response");
        for tracer in self.tracers.load().iter() {
            tracer.response_sent(request_id, action);
        }
    }

    pub fn error_sent(&self, request_id: u64, action: &str, error: &RemoteError) {
        tracing::trace!(
            target: TRACE_TARGET,
            request_id,
            action,
            error = %error,
            "sent error response"
        );
        for tracer in self.tracers.load().iter() {
            tracer.error_sent(request_id, action, error);
        }
    }

    pub fn response_received(&self, request_id: u64, node: &NodeDescriptor, action: &str) {
        if !self.enabled(action) {
            return;
        }
        tracing::trace!(
            target: TRACE_TARGET,
            request_id,
            action,
            node = %node,
            "received response"
        );
        for tracer in self.tracers.load().iter() {
            tracer.response_received(request_id, node, action);
        }
    }
}

impl Default for TracerHub {
    fn default() -> Self {
        Self::new(TraceFilter::default())
    }
}
