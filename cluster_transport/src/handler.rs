// SPDX-License-Identifier: MIT OR Apache-2.0
//! Inbound request handlers keyed by action name.

use std::{marker::PhantomData, sync::Arc};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    channel::TransportChannel,
    codec::{Envelope, Streamable},
    error::{Result, TransportError},
    executor::names,
};

/// Error a handler body may fail with. It is reported to the caller as a
/// remote error carrying its display text.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Processes inbound requests for one action.
pub trait RequestHandler: Send + Sync + 'static {
    type Request: Streamable + Send + 'static;

    /// Blank request the body is decoded into.
    fn new_instance(&self) -> Self::Request;

    /// Category the body runs on.
    fn executor(&self) -> &str {
        names::GENERIC
    }

    /// Handles `request`, answering through `channel`.
    ///
    /// Returning an error sends it back as a remote error unless a response
    /// was already sent.
    ///
    /// # Errors
    ///
    /// Any failure of the handler body.
    fn message_received(&self, request: Self::Request, channel: TransportChannel)
        -> HandlerResult;
}

/// [`RequestHandler`] built from a closure.
pub struct HandlerFn<T, F> {
    executor: String,
    f: F,
    _request: PhantomData<fn() -> T>,
}

impl<T, F> HandlerFn<T, F>
where
    T: Streamable + Default + Send + 'static,
    F: Fn(T, TransportChannel) -> HandlerResult + Send + Sync + 'static,
{
    pub fn new(executor: impl Into<String>, f: F) -> Self {
        Self {
            executor: executor.into(),
            f,
            _request: PhantomData,
        }
    }
}

impl<T, F> RequestHandler for HandlerFn<T, F>
where
    T: Streamable + Default + Send + 'static,
    F: Fn(T, TransportChannel) -> HandlerResult + Send + Sync + 'static,
{
    type Request = T;

    fn new_instance(&self) -> T {
        T::default()
    }

    fn executor(&self) -> &str {
        &self.executor
    }

    fn message_received(&self, request: T, channel: TransportChannel) -> HandlerResult {
        (self.f)(request, channel)
    }
}

/// A decoded request bound to its handler, ready to run.
pub(crate) type Invocation = Box<dyn FnOnce(TransportChannel) -> HandlerResult + Send>;

/// Type-erased request handler.
pub(crate) trait ErasedRequestHandler: Send + Sync {
    fn executor(&self) -> &str;

    /// Decodes the request body. Runs on the I/O path so a malformed body is
    /// rejected before any executor is involved.
    fn prepare(self: Arc<Self>, envelope: &Envelope) -> Result<Invocation>;
}

struct Erased<H>(H);

impl<H: RequestHandler> ErasedRequestHandler for Erased<H> {
    fn executor(&self) -> &str {
        self.0.executor()
    }

    fn prepare(self: Arc<Self>, envelope: &Envelope) -> Result<Invocation> {
        let mut request = self.0.new_instance();
        envelope.decode_body(&mut request)?;
        Ok(Box::new(move |channel| {
            self.0.message_received(request, channel)
        }))
    }
}

/// Registry of request handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn ErasedRequestHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns `DuplicateHandler` if `action` already has a handler.
    pub fn register<H: RequestHandler>(&self, action: impl Into<String>, handler: H) -> Result<()> {
        match self.handlers.entry(action.into()) {
            Entry::Occupied(entry) => Err(TransportError::DuplicateHandler(entry.key().clone())),
            Entry::Vacant(entry) => {
                tracing::debug!(action = %entry.key(), executor = handler.executor(), "registered handler");
                entry.insert(Arc::new(Erased(handler)));
                Ok(())
            },
        }
    }

    /// Returns `true` if a handler was removed.
    pub fn remove(&self, action: &str) -> bool {
        self.handlers.remove(action).is_some()
    }

    pub(crate) fn get(&self, action: &str) -> Option<Arc<dyn ErasedRequestHandler>> {
        self.handlers.get(action).map(|h| h.value().clone())
    }

    #[must_use]
    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Executor category of the handler for `action`.
    #[must_use]
    pub fn executor_of(&self, action: &str) -> Option<String> {
        self.handlers
            .get(action)
            .map(|h| h.value().executor().to_string())
    }

    /// Registered action names, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        actions.sort_unstable();
        actions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
