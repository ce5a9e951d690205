use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheduling class of a tracker.
///
/// `Internal` trackers are runtime housekeeping (schedule polls, timeout
/// sweeps, listener polls). They execute immediately and never count against
/// the external concurrency budget. `Level(n)` trackers are queued; higher
/// levels drain first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackerPriority {
    Internal,
    Level(usize),
}

impl TrackerPriority {
    pub fn is_internal(self) -> bool {
        matches!(self, Self::Internal)
    }

    pub fn level(self) -> Option<usize> {
        match self {
            Self::Internal => None,
            Self::Level(l) => Some(l),
        }
    }
}

impl fmt::Display for TrackerPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => f.write_str("internal"),
            Self::Level(l) => write!(f, "L{l}"),
        }
    }
}
