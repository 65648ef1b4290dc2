// SPDX-License-Identifier: MIT OR Apache-2.0
//! Caller-side response handling.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    codec::{Envelope, Streamable},
    error::{Result, TransportError},
    executor::names,
};

/// Receives the single outcome of an outbound request.
pub trait ResponseHandler: Send + Sync + 'static {
    type Response: Streamable + Send + 'static;

    /// Blank response the body is decoded into.
    fn new_instance(&self) -> Self::Response;

    /// Category the outcome is delivered on.
    fn executor(&self) -> &str {
        names::SAME
    }

    fn handle_response(&self, response: Self::Response);

    fn handle_exception(&self, error: TransportError);
}

/// Raw outcome before it is decoded for the handler.
#[derive(Debug)]
pub(crate) enum ResponseOutcome {
    Body(Envelope),
    Failed(TransportError),
}

/// Type-erased response handler. Delivery consumes it.
pub(crate) trait ErasedResponseHandler: Send + Sync {
    fn executor(&self) -> &str;

    fn deliver(self: Box<Self>, outcome: ResponseOutcome);
}

struct Erased<H>(H);

impl<H: ResponseHandler> ErasedResponseHandler for Erased<H> {
    fn executor(&self) -> &str {
        self.0.executor()
    }

    fn deliver(self: Box<Self>, outcome: ResponseOutcome) {
        match outcome {
            ResponseOutcome::Body(envelope) => {
                let mut response = self.0.new_instance();
                match envelope.decode_body(&mut response) {
                    Ok(()) => self.0.handle_response(response),
                    Err(e) => self.0.handle_exception(e),
                }
            },
            ResponseOutcome::Failed(error) => self.0.handle_exception(error),
        }
    }
}

pub(crate) fn erase<H: ResponseHandler>(handler: H) -> Box<dyn ErasedResponseHandler> {
    Box::new(Erased(handler))
}

/// Awaitable result of `submit_request`.
#[must_use = "a transport future does nothing unless awaited"]
#[derive(Debug)]
pub struct TransportFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TransportFuture<T> {
    pub(crate) fn pair() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Blocks the current thread until the outcome arrives.
    ///
    /// Must not be called from within an async context.
    ///
    /// # Errors
    ///
    /// Returns the request's failure.
    pub fn blocking_get(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(TransportError::Stopped))
    }
}

impl<T> Future for TransportFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TransportError::Stopped)))
    }
}

/// Handler that resolves a [`TransportFuture`].
pub(crate) struct FutureResponseHandler<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T> FutureResponseHandler<T> {
    pub(crate) fn new(tx: oneshot::Sender<Result<T>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn resolve(&self, outcome: Result<T>) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

impl<T: Streamable + Default + Send + 'static> ResponseHandler for FutureResponseHandler<T> {
    type Response = T;

    fn new_instance(&self) -> T {
        T::default()
    }

    fn handle_response(&self, response: T) {
        self.resolve(Ok(response));
    }

    fn handle_exception(&self, error: TransportError) {
        self.resolve(Err(error));
    }
}

/// Forwards to a caller-supplied handler, then resolves a future.
pub(crate) struct ForwardingResponseHandler<H: ResponseHandler> {
    inner: H,
    future: FutureResponseHandler<H::Response>,
}

impl<H: ResponseHandler> ForwardingResponseHandler<H> {
    pub(crate) fn new(inner: H, tx: oneshot::Sender<Result<H::Response>>) -> Self {
        Self {
            inner,
            future: FutureResponseHandler::new(tx),
        }
    }
}

impl<H> ResponseHandler for ForwardingResponseHandler<H>
where
    H: ResponseHandler,
    H::Response: Clone,
{
    type Response = H::Response;

    fn new_instance(&self) -> Self::Response {
        self.inner.new_instance()
    }

    fn executor(&self) -> &str {
        self.inner.executor()
    }

    fn handle_response(&self, response: Self::Response) {
        self.inner.handle_response(response.clone());
        self.future.resolve(Ok(response));
    }

    fn handle_exception(&self, error: TransportError) {
        self.inner.handle_exception(error.clone());
        self.future.resolve(Err(error));
    }
}
