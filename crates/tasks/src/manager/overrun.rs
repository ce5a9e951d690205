use std::sync::atomic::Ordering;

use tokio::time::Instant;
use tracing::warn;

use super::core::Shared;

impl Shared {
    /// Two-phase overrun handling.
    ///
    /// A tracker past its processing budget is cancelled. If it is still
    /// running one kill grace later its slot is reclaimed; the body keeps
    /// running and is reported as killed-but-returned if it ever finishes.
    pub(super) fn check_overruns(&self, now: Instant) {
        let grace = self.policy.kill_grace();
        for mut entry in self.active.iter_mut() {
            let tracker = entry.value_mut();
            if tracker.killed {
                continue;
            }
            match tracker.cancelled_at {
                None => {
                    let Some(limit) = tracker.max_processing_time else {
                        continue;
                    };
                    if now.saturating_duration_since(tracker.started) >= limit {
                        tracker.cancel.cancel();
                        tracker.cancelled_at = Some(now);
                        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            tracker = %tracker.name,
                            ?limit,
                            "tracker exceeded processing time, cancelling"
                        );
                    }
                }
                Some(at) if now.saturating_duration_since(at) >= grace => {
                    tracker.killed = true;
                    self.availability.kill(tracker.priority);
                    self.counters.killed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tracker = %tracker.name,
                        process_slot = tracker.process_slot,
                        "tracker ignored cancellation, reclaiming its slot"
                    );
                }
                Some(_) => {}
            }
        }
    }
}
