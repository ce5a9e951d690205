use stellwerk_core::MessageFilter;

use crate::master::MasterJobState;
use crate::outgoing::TimedOutRequest;

/// Notifications raised by a command. Subscribe through
/// [`Command::events`](crate::Command::events).
#[derive(Debug, Clone)]
pub enum CommandEvent {
    RequestTimedOut(TimedOutRequest),
    /// A response arrived for a request that is no longer tracked.
    UnrecognizedResponse {
        correlation_id: String,
        header: String,
    },
    MasterJobStateChanged {
        from: MasterJobState,
        to: MasterJobState,
    },
    /// The set of supported messages changed.
    CommandChanged {
        filter: MessageFilter,
        registered: bool,
    },
}
