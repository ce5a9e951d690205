//! Correlation-keyed tracking of requests awaiting a response.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use stellwerk_core::{ServiceMessageHeader, TransmissionPayload};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CommandError;

pub type ResponseResult = Result<TransmissionPayload, CommandError>;

struct OutgoingRequest {
    header: ServiceMessageHeader,
    started: Instant,
    ttl: Duration,
    waiter: oneshot::Sender<ResponseResult>,
}

/// A request removed by the timeout sweep.
#[derive(Debug, Clone, Serialize)]
pub struct TimedOutRequest {
    pub id: String,
    pub header: String,
    pub ttl: Duration,
}

/// The caller's side of an outgoing request.
#[derive(Debug)]
pub struct PendingResponse {
    pub id: String,
    receiver: oneshot::Receiver<ResponseResult>,
}

impl PendingResponse {
    /// Wait for the response, a timeout or a cancellation.
    pub async fn wait(self) -> ResponseResult {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(CommandError::Cancelled(self.id)))
    }
}

/// Outstanding requests by correlation id.
///
/// Every tracker leaves the map exactly once: through [`resolve`],
/// [`abort`] or [`sweep_timeouts`]. Whichever comes second finds nothing
/// and is a no-op.
///
/// [`resolve`]: OutgoingRequests::resolve
/// [`abort`]: OutgoingRequests::abort
/// [`sweep_timeouts`]: OutgoingRequests::sweep_timeouts
#[derive(Default)]
pub struct OutgoingRequests {
    trackers: DashMap<String, OutgoingRequest>,
}

impl OutgoingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request under `id`. A duplicate id is rejected and the
    /// existing tracker is left untouched.
    pub fn insert(
        &self,
        id: &str,
        header: ServiceMessageHeader,
        ttl: Duration,
    ) -> Result<PendingResponse, CommandError> {
        let id = id.to_uppercase();
        match self.trackers.entry(id.clone()) {
            Entry::Occupied(_) => Err(CommandError::DuplicateRequest(id)),
            Entry::Vacant(slot) => {
                let (waiter, receiver) = oneshot::channel();
                slot.insert(OutgoingRequest {
                    header,
                    started: Instant::now(),
                    ttl,
                    waiter,
                });
                Ok(PendingResponse { id, receiver })
            }
        }
    }

    /// Hand `response` to the waiter of `id`. Returns false when no such
    /// request is outstanding.
    pub fn resolve(&self, id: &str, response: TransmissionPayload) -> bool {
        match self.trackers.remove(&id.to_uppercase()) {
            Some((_, request)) => {
                // The caller may have stopped waiting; that is fine.
                let _ = request.waiter.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Cancel the waiter of `id`.
    pub fn abort(&self, id: &str) -> bool {
        let id = id.to_uppercase();
        match self.trackers.remove(&id) {
            Some((_, request)) => {
                let _ = request.waiter.send(Err(CommandError::Cancelled(id)));
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding request.
    pub fn abort_all(&self) -> usize {
        let ids: Vec<String> = self.trackers.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.abort(id)).count()
    }

    /// Remove every request whose TTL has elapsed at `now` and fail its
    /// waiter with a timeout.
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<TimedOutRequest> {
        let expired: Vec<String> = self
            .trackers
            .iter()
            .filter(|e| now.saturating_duration_since(e.started) >= e.ttl)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let (_, request) = self.trackers.remove(&id)?;
                debug!(request = %id, ttl = ?request.ttl, "outgoing request timed out");
                let _ = request.waiter.send(Err(CommandError::Timeout {
                    id: id.clone(),
                    ttl: request.ttl,
                }));
                Some(TimedOutRequest {
                    id,
                    header: request.header.to_string(),
                    ttl: request.ttl,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.trackers.contains_key(&id.to_uppercase())
    }

    /// One line per outstanding request, for statistics.
    pub fn debug_strings(&self) -> Vec<String> {
        let now = Instant::now();
        self.trackers
            .iter()
            .map(|e| {
                format!(
                    "{} {} {}ms/{}ms",
                    e.key(),
                    e.header,
                    now.saturating_duration_since(e.started).as_millis(),
                    e.ttl.as_millis()
                )
            })
            .collect()
    }
}
