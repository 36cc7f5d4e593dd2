//! Pending requests and their completion handles
//!
//! A [`PendingRequest`] is created for every enqueued call and travels from the
//! queue to the in-flight slot. Its completion slot is a one-shot channel:
//! [`PendingRequest::complete`] consumes the entry, so an entry can only ever be
//! completed once, and dropping an entry that was never completed resolves the
//! caller with `ServiceUnavailable` instead of leaving it hanging.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;
use toolgate_common::{Result, ToolgateError, METRICS};
use toolgate_proto::{RpcRequest, RpcResponse};
use tracing::trace;
use uuid::Uuid;

/// Outcome delivered to the caller
pub type Reply = Result<RpcResponse>;

/// Correlation id of a request, also used as the JSON-RPC `id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request waiting in the queue or in flight
pub struct PendingRequest {
    id: RequestId,
    method: String,
    payload: String,
    enqueued_at: Instant,
    responder: Option<oneshot::Sender<Reply>>,
}

impl PendingRequest {
    /// Create an entry for `request` and the handle its caller awaits
    ///
    /// The request's `id` becomes the correlation id.
    pub fn new(request: &RpcRequest) -> Result<(Self, Completion)> {
        let payload = request.to_record()?;
        let id = RequestId::from(request.id.clone());
        Ok(Self::with_payload(id, request.method.as_str(), payload))
    }

    /// Create an entry around an already serialized record
    pub fn with_payload(
        id: RequestId,
        method: impl Into<String>,
        payload: impl Into<String>,
    ) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let entry = Self {
            id: id.clone(),
            method: method.into(),
            payload: payload.into(),
            enqueued_at: Instant::now(),
            responder: Some(tx),
        };
        (entry, Completion { id, rx })
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Serialized record written to the worker
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Deliver the terminal outcome
    ///
    /// Returns false when the caller stopped waiting.
    pub fn complete(mut self, reply: Reply) -> bool {
        self.resolve(reply)
    }

    fn resolve(&mut self, reply: Reply) -> bool {
        let Some(responder) = self.responder.take() else {
            return false;
        };

        let outcome = match &reply {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        METRICS.record_completion(outcome, self.enqueued_at.elapsed().as_secs_f64());
        trace!("Completing request {} ({}) with {}", self.id, self.method, outcome);

        responder.send(reply).is_ok()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.responder.is_some() {
            self.resolve(Err(ToolgateError::service_unavailable(
                "request was dropped before completion",
            )));
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("enqueued_at", &self.enqueued_at)
            .field("completed", &self.responder.is_none())
            .finish()
    }
}

/// Caller side of a pending request; resolves exactly once
#[derive(Debug)]
pub struct Completion {
    id: RequestId,
    rx: oneshot::Receiver<Reply>,
}

impl Completion {
    /// A completion that is already resolved with `error`
    pub fn failed(error: ToolgateError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            id: RequestId::new(),
            rx,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for Completion {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ToolgateError::service_unavailable("supervisor stopped"))
            })
        })
    }
}
