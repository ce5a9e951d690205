use chrono::{DateTime, Utc};

use crate::availability::TaskAvailability;
use crate::error::TaskError;
use crate::manager::TaskSubmitter;
use crate::tracker::TaskTracker;

/// Periodic work driven by the task manager loop on every cycle.
///
/// Processes run on the loop itself, in descending [`priority`](Self::priority)
/// order, so they must not block: anything slow belongs in a tracker
/// submitted through the scope.
pub trait ManagedProcess: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn process(&self, scope: &ProcessScope<'_>) -> Result<(), TaskError>;
}

/// What a process sees during one loop cycle.
pub struct ProcessScope<'a> {
    pub availability: &'a TaskAvailability,
    pub now: DateTime<Utc>,
    submitter: &'a TaskSubmitter,
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(availability: &'a TaskAvailability, submitter: &'a TaskSubmitter) -> Self {
        Self {
            availability,
            now: Utc::now(),
            submitter,
        }
    }

    pub fn submit(&self, tracker: TaskTracker) {
        self.submitter.execute_or_enqueue(tracker);
    }

    pub fn submitter(&self) -> &TaskSubmitter {
        self.submitter
    }
}
