//! Microservice host.
//!
//! Wires a [`stellwerk_tasks::TaskManager`], the scheduler, a
//! [`stellwerk_comms::CommunicationContainer`] and registered
//! [`stellwerk_command::Command`]s into one runnable service, with TOML + env
//! configuration, tracing setup and a JSON statistics endpoint.

pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod routing;
pub mod server;

pub use config::{ServiceConfig, ServiceSection};
pub use error::ServiceError;
pub use host::{Microservice, ServiceStatistics};
pub use logging::init_tracing;
pub use routing::{MessageRouter, RoutingStatistics};
pub use server::{serve_statistics, spawn_statistics_server, statistics_router};
