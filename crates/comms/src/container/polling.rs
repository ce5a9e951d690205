use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use stellwerk_core::TransmissionPayload;
use stellwerk_tasks::{
    ManagedProcess, ProcessScope, TaskError, TaskSubmitter, TaskTracker, TrackerKind,
    TrackerPriority,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::CommunicationContainer;
use crate::client::PayloadProcessor;
use crate::holder::ClientHolder;

/// Slots held against the task manager's budget before trackers occupy
/// them. Released on drop, so an abandoned poll or payload never leaks.
struct Reservation {
    pending: Arc<AtomicI64>,
    held: i64,
}

impl Reservation {
    fn new(pending: Arc<AtomicI64>, slots: usize) -> Self {
        let held = slots as i64;
        pending.fetch_add(held, Ordering::AcqRel);
        Self { pending, held }
    }

    /// Move one slot into its own reservation, taking a fresh one if this
    /// reservation is used up.
    fn split_one(&mut self) -> Self {
        if self.held > 0 {
            self.held -= 1;
            Self {
                pending: Arc::clone(&self.pending),
                held: 1,
            }
        } else {
            Self::new(Arc::clone(&self.pending), 1)
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.pending.fetch_sub(self.held, Ordering::AcqRel);
    }
}

impl ManagedProcess for CommunicationContainer {
    fn name(&self) -> &str {
        "communication"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn process(&self, scope: &ProcessScope<'_>) -> Result<(), TaskError> {
        let levels = scope.availability.priority_levels();
        if self.needs_recalculation(Instant::now()) {
            self.recalculate(levels);
        }
        let Some(processor) = self.processor.read().clone() else {
            return Ok(());
        };
        let collection = self.collection();

        for level in (0..levels).rev() {
            let free = scope.availability.level_available(level) - self.pending_slots();
            let mut available = free.max(0) as usize;
            while let Some((holder, batch)) = collection.take_next(level, available) {
                available -= batch;
                trace!(listener = %holder.id(), level, batch, "granting poll");
                let tracker = self.poll_tracker(
                    holder,
                    batch,
                    level,
                    Arc::clone(&processor),
                    scope.submitter().clone(),
                );
                scope.submit(tracker);
            }
        }
        Ok(())
    }
}

impl CommunicationContainer {
    fn poll_tracker(
        &self,
        holder: Arc<ClientHolder>,
        batch: usize,
        level: usize,
        processor: Arc<dyn PayloadProcessor>,
        submitter: TaskSubmitter,
    ) -> TaskTracker {
        self.counters.polls_started.fetch_add(1, Ordering::Relaxed);
        let mut reservation = Reservation::new(Arc::clone(&self.pending), batch);
        let counters = Arc::clone(&self.counters);
        let release = Arc::clone(&holder);
        let limit = self.policy.poll_timeout();

        TaskTracker::new(
            format!("poll:{}", holder.id()),
            TrackerKind::ListenerPoll,
            TrackerPriority::Internal,
            move |cancel: CancellationToken| async move {
                let payloads = tokio::select! {
                    _ = cancel.cancelled() => {
                        holder.record_failure("poll cancelled", limit);
                        return Err(TaskError::Cancelled);
                    }
                    result = holder.poll(batch) => result?,
                };
                debug!(listener = %holder.id(), received = payloads.len(), "poll complete");
                counters
                    .payloads_received
                    .fetch_add(payloads.len() as u64, Ordering::Relaxed);
                for payload in payloads {
                    let slot = reservation.split_one();
                    submitter.execute_or_enqueue(payload_tracker(
                        payload,
                        level,
                        slot,
                        Arc::clone(&processor),
                    ));
                }
                Ok(())
            },
        )
        .with_max_processing_time(limit)
        .on_complete(move |_| release.release())
    }
}

fn payload_tracker(
    payload: TransmissionPayload,
    level: usize,
    slot: Reservation,
    processor: Arc<dyn PayloadProcessor>,
) -> TaskTracker {
    let limit = payload.max_processing_time;
    let tracker = TaskTracker::new(
        format!("payload:{}", payload.message.header),
        TrackerKind::Payload,
        TrackerPriority::Level(level),
        move |_| async move {
            // Admitted: the tracker now holds a real slot.
            drop(slot);
            processor.process_payload(payload).await
        },
    );
    match limit {
        Some(limit) => tracker.with_max_processing_time(limit),
        None => tracker,
    }
}
