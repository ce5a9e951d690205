//! Per-listener bookkeeping: the in-flight flag that keeps a client to one
//! poll at a time and the statistics the priority algorithm weighs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use stellwerk_core::TransmissionPayload;
use tokio::time::Instant;

use crate::client::ListenerClient;
use crate::error::CommsError;

/// Weight of the latest poll in the decayed error rate.
const ERROR_DECAY: f64 = 0.2;

#[derive(Debug, Default)]
struct PollHistory {
    error_rate: f64,
    empty_streak: u32,
    last_poll: Option<DateTime<Utc>>,
    last_duration: Option<Duration>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatistics {
    pub id: String,
    pub channel_id: String,
    pub priority: usize,
    pub polling: bool,
    pub polls: u64,
    pub poll_errors: u64,
    pub received: u64,
    pub error_rate: f64,
    pub empty_streak: u32,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
}

/// A listener client plus its polling state.
pub struct ClientHolder {
    client: Arc<dyn ListenerClient>,
    polling: AtomicBool,
    polls: AtomicU64,
    poll_errors: AtomicU64,
    received: AtomicU64,
    history: Mutex<PollHistory>,
}

impl ClientHolder {
    pub fn new(client: Arc<dyn ListenerClient>) -> Self {
        Self {
            client,
            polling: AtomicBool::new(false),
            polls: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            received: AtomicU64::new(0),
            history: Mutex::new(PollHistory::default()),
        }
    }

    pub fn client(&self) -> &Arc<dyn ListenerClient> {
        &self.client
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    pub fn priority(&self) -> usize {
        self.client.priority()
    }

    /// Claim the client for one poll. Fails if a poll is already in flight.
    pub fn try_acquire(&self) -> bool {
        self.polling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.polling.store(false, Ordering::Release);
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// Poll the client and fold the result into its statistics.
    pub async fn poll(&self, max: usize) -> Result<Vec<TransmissionPayload>, CommsError> {
        let started = Instant::now();
        let result = self.client.poll(max).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(payloads) => self.record_success(payloads.len(), elapsed),
            Err(e) => self.record_failure(&e.to_string(), elapsed),
        }
        result
    }

    pub fn record_success(&self, received: usize, elapsed: Duration) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.received.fetch_add(received as u64, Ordering::Relaxed);
        let mut h = self.history.lock();
        h.error_rate *= 1.0 - ERROR_DECAY;
        h.empty_streak = if received == 0 { h.empty_streak.saturating_add(1) } else { 0 };
        h.last_poll = Some(Utc::now());
        h.last_duration = Some(elapsed);
    }

    pub fn record_failure(&self, error: &str, elapsed: Duration) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
        let mut h = self.history.lock();
        h.error_rate = h.error_rate * (1.0 - ERROR_DECAY) + ERROR_DECAY;
        h.last_poll = Some(Utc::now());
        h.last_duration = Some(elapsed);
        h.last_error = Some(error.to_string());
    }

    /// Decayed share of recent polls that failed, in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        self.history.lock().error_rate
    }

    /// Consecutive polls that returned nothing.
    pub fn empty_streak(&self) -> u32 {
        self.history.lock().empty_streak
    }

    pub fn statistics(&self) -> ListenerStatistics {
        let h = self.history.lock();
        ListenerStatistics {
            id: self.client.id().to_string(),
            channel_id: self.client.channel_id().to_string(),
            priority: self.client.priority(),
            polling: self.is_polling(),
            polls: self.polls.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            error_rate: h.error_rate,
            empty_streak: h.empty_streak,
            last_poll: h.last_poll,
            last_duration: h.last_duration,
            last_error: h.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for ClientHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHolder")
            .field("id", &self.client.id())
            .field("polling", &self.is_polling())
            .finish_non_exhaustive()
    }
}
