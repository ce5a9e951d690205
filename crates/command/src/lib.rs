//! Message processing for a microservice: handler dispatch, outgoing
//! request tracking and master-job negotiation.

pub mod command;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod master;
mod master_job;
pub mod outgoing;
pub mod policy;

pub use command::{Command, CommandStatistics, OutgoingStatistics};
pub use dispatch::{DispatchTable, Handler, HandlerResult, HandlerStatistics, RequestContext};
pub use error::CommandError;
pub use event::CommandEvent;
pub use master::{
    MasterJobAction, MasterJobEffect, MasterJobNegotiator, MasterJobState, MasterJobStatistics,
    StandbyPartner,
};
pub use outgoing::{OutgoingRequests, PendingResponse, ResponseResult, TimedOutRequest};
pub use policy::{CommandPolicy, MasterJobPolicy};
