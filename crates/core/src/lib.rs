pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod header;
pub mod identity;
pub mod message;
pub mod observer;
pub mod payload;

pub use collector::{DataCollector, LogLevel, TracingCollector};
pub use dispatcher::Dispatcher;
pub use error::CoreError;
pub use header::{MatchSpecificity, MessageFilter, ServiceMessageHeader};
pub use identity::ServiceIdentity;
pub use message::{MessageStatus, ServiceMessage};
pub use observer::{Observers, SubscriptionId};
pub use payload::{ProcessOptions, TransmissionPayload};
