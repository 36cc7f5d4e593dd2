//! Single-flight request dispatcher
//!
//! The dispatcher owns the request queue and the in-flight slot. It never
//! waits on anything itself: the supervisor task feeds it events (new entry,
//! worker output, timer tick) and it reacts synchronously. Writes to the
//! worker are queued on its [`WorkerLink`], so a worker that stops reading
//! still runs into the request timeout.
//!
//! States are `Idle` (no in-flight entry) and `AwaitingReply`. Leaving
//! `AwaitingReply` always completes the in-flight entry: with the reply, with
//! `MalformedResponse`, with `Timeout`, or with `WorkerCrashed`.

use std::time::Duration;

use tokio::time::Instant;
use toolgate_common::{ToolgateError, METRICS};
use toolgate_proto::RpcResponse;
use tracing::{debug, trace, warn};

use crate::health::WorkerState;
use crate::pending::PendingRequest;
use crate::process::WorkerLink;
use crate::queue::RequestQueue;

/// The request currently written to the worker
#[derive(Debug)]
struct InFlight {
    entry: PendingRequest,
    deadline: Instant,
}

/// What happened to one stdout record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Completed the in-flight request
    Completed,

    /// Carried the id of a request that is no longer in flight
    Discarded,

    /// Arrived while nothing was in flight
    Unsolicited,
}

#[derive(Debug)]
pub struct Dispatcher {
    queue: RequestQueue,
    in_flight: Option<InFlight>,
    request_timeout: Duration,

    /// Pause between rejections while the worker is not healthy
    unavailable_retry: Duration,
    retry_at: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        request_timeout: Duration,
        unavailable_retry: Duration,
        max_queue_size: Option<usize>,
    ) -> Self {
        Self {
            queue: RequestQueue::new(max_queue_size),
            in_flight: None,
            request_timeout,
            unavailable_retry,
            retry_at: None,
        }
    }

    /// Append an entry, or reject it if the queue is full
    pub fn enqueue(&mut self, entry: PendingRequest) {
        METRICS.requests.enqueued_total.inc();

        if let Err(entry) = self.queue.push(entry) {
            let max = self.queue.max_size().unwrap_or_default();
            warn!("Request queue full ({} entries), rejecting {}", max, entry.id());
            entry.complete(Err(ToolgateError::queue_full(format!(
                "{} requests already waiting",
                max
            ))));
        }
    }

    /// Advance the queue if nothing is in flight
    ///
    /// While the worker is not healthy, the head entry is rejected right away
    /// and the next rejection waits for `unavailable_retry`.
    pub fn try_dispatch(&mut self, state: WorkerState, worker: Option<&WorkerLink>) {
        if self.in_flight.is_some() || self.queue.is_empty() {
            return;
        }

        if state.is_terminal() {
            self.reject_all(&format!("worker is {}", state));
            return;
        }

        let worker = match worker {
            Some(worker) if state.is_healthy() => worker,
            _ => {
                if self.retry_at.is_some() {
                    return;
                }
                if let Some(entry) = self.queue.pop() {
                    debug!("Rejecting {} while worker is {}", entry.id(), state);
                    entry.complete(Err(ToolgateError::service_unavailable(format!(
                        "worker is {}",
                        state
                    ))));
                }
                self.retry_at = Some(Instant::now() + self.unavailable_retry);
                return;
            }
        };

        self.retry_at = None;
        let Some(entry) = self.queue.pop() else {
            return;
        };

        match worker.write(entry.payload()) {
            Ok(()) => {
                trace!("Dispatched {} ({})", entry.id(), entry.method());
                METRICS.requests.in_flight.set(1);
                self.in_flight = Some(InFlight {
                    entry,
                    deadline: Instant::now() + self.request_timeout,
                });
            }
            Err(e) => {
                // Stdin is gone; the exit event follows shortly
                warn!("Failed to write {} to worker: {}", entry.id(), e);
                entry.complete(Err(ToolgateError::service_unavailable(e.to_string())));
                self.retry_at = Some(Instant::now() + self.unavailable_retry);
            }
        }
    }

    /// Handle one stdout record from a healthy worker
    pub fn on_reply(&mut self, record: &[u8]) -> ReplyDisposition {
        let Some(in_flight) = self.in_flight.as_ref() else {
            debug!("Discarding worker output with nothing in flight");
            METRICS.requests.late_replies_discarded.inc();
            return ReplyDisposition::Unsolicited;
        };

        let reply = match RpcResponse::parse(record) {
            Ok(reply) => reply,
            Err(e) => {
                if let Some(in_flight) = self.take_in_flight() {
                    warn!("Malformed reply for {}: {}", in_flight.entry.id(), e);
                    in_flight
                        .entry
                        .complete(Err(ToolgateError::malformed_response(e.to_string())));
                }
                return ReplyDisposition::Completed;
            }
        };

        // Replies without an id are attributed to whatever is in flight
        if let Some(id) = reply.correlation_id() {
            if id != in_flight.entry.id().as_str() {
                debug!(
                    "Discarding reply for {} while {} is in flight",
                    id,
                    in_flight.entry.id()
                );
                METRICS.requests.late_replies_discarded.inc();
                return ReplyDisposition::Discarded;
            }
        }

        if let Some(in_flight) = self.take_in_flight() {
            in_flight.entry.complete(Ok(reply));
        }
        ReplyDisposition::Completed
    }

    /// Fire expired timers
    pub fn on_tick(&mut self, now: Instant) {
        if self.in_flight.as_ref().is_some_and(|f| f.deadline <= now) {
            if let Some(in_flight) = self.take_in_flight() {
                warn!(
                    "Request {} timed out after {:?}",
                    in_flight.entry.id(),
                    self.request_timeout
                );
                in_flight.entry.complete(Err(ToolgateError::timeout(format!(
                    "no reply within {:?}",
                    self.request_timeout
                ))));
            }
        }

        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
        }
    }

    /// Complete the in-flight entry with `error`; returns whether there was one
    pub fn abort_in_flight(&mut self, error: ToolgateError) -> bool {
        match self.take_in_flight() {
            Some(in_flight) => {
                warn!("Aborting {}: {}", in_flight.entry.id(), error);
                in_flight.entry.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Complete every entry, in flight and queued, with `ServiceUnavailable`
    pub fn drain(&mut self, reason: &str) {
        if let Some(in_flight) = self.take_in_flight() {
            in_flight
                .entry
                .complete(Err(ToolgateError::service_unavailable(reason)));
        }
        self.reject_all(reason);
        self.retry_at = None;
    }

    /// Allow the next dispatch attempt without waiting for the pacing delay
    pub fn clear_retry(&mut self) {
        self.retry_at = None;
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let timeout = self.in_flight.as_ref().map(|f| f.deadline);
        match (timeout, self.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn take_in_flight(&mut self) -> Option<InFlight> {
        let in_flight = self.in_flight.take()?;
        METRICS.requests.in_flight.set(0);
        Some(in_flight)
    }

    fn reject_all(&mut self, reason: &str) {
        for entry in self.queue.drain() {
            entry.complete(Err(ToolgateError::service_unavailable(reason)));
        }
    }
}
