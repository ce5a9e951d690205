use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;
use crate::priority::TrackerPriority;

/// Tracker body: receives its cancellation token, resolves to the outcome.
pub type ExecuteFn =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), TaskError>> + Send>;

/// Called once with the tracker's outcome, on the executing task.
pub type CompleteFn = Box<dyn FnOnce(&TrackerOutcome) + Send>;

/// What submitted the tracker. Used for statistics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackerKind {
    Schedule,
    Payload,
    ListenerPoll,
    Process,
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Schedule => "schedule",
            Self::Payload => "payload",
            Self::ListenerPoll => "listener_poll",
            Self::Process => "process",
        };
        f.write_str(s)
    }
}

/// One unit of submitted work.
pub struct TaskTracker {
    pub id: Uuid,
    pub name: String,
    pub kind: TrackerKind,
    pub priority: TrackerPriority,
    /// Long-running trackers are exempt from overrun cancellation.
    pub is_long_running: bool,
    pub max_processing_time: Option<Duration>,
    pub cancel: CancellationToken,
    pub created_at: Instant,
    pub(crate) execute: Option<ExecuteFn>,
    pub(crate) on_complete: Option<CompleteFn>,
}

impl TaskTracker {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        kind: TrackerKind,
        priority: TrackerPriority,
        execute: F,
    ) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            priority,
            is_long_running: false,
            max_processing_time: None,
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
            execute: Some(Box::new(move |token: CancellationToken| execute(token).boxed())),
            on_complete: None,
        }
    }

    pub fn with_max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_time = Some(limit);
        self
    }

    pub fn long_running(mut self) -> Self {
        self.is_long_running = true;
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&TrackerOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTracker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("is_long_running", &self.is_long_running)
            .field("max_processing_time", &self.max_processing_time)
            .finish_non_exhaustive()
    }
}

/// Result handed to a tracker's completion callback.
#[derive(Debug, Clone)]
pub struct TrackerOutcome {
    pub id: Uuid,
    pub name: String,
    pub kind: TrackerKind,
    pub priority: TrackerPriority,
    pub process_slot: u64,
    pub result: Result<(), TaskError>,
    pub duration: Duration,
    /// Overrun cancellation was signalled before the body returned.
    pub cancelled: bool,
    /// The slot was reclaimed before the body returned.
    pub killed: bool,
}

impl TrackerOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
