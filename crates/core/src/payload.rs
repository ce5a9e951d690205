use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::ServiceMessage;

/// Where an outgoing payload may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// May be handled by a command in this process.
    pub route_internal: bool,
    /// May be handed to an external sender client.
    pub route_external: bool,
}

impl ProcessOptions {
    pub const INTERNAL_ONLY: Self = Self {
        route_internal: true,
        route_external: false,
    };
    pub const EXTERNAL_ONLY: Self = Self {
        route_internal: false,
        route_external: true,
    };
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            route_internal: true,
            route_external: true,
        }
    }
}

/// A message plus the transport metadata the runtime needs to process it.
#[derive(Debug, Clone)]
pub struct TransmissionPayload {
    pub id: Uuid,
    pub message: ServiceMessage,
    /// Id of the listener client that produced this payload, if any.
    pub source: Option<String>,
    /// Processing budget; the runtime default applies when `None`.
    pub max_processing_time: Option<Duration>,
    pub options: ProcessOptions,
    pub received_at: DateTime<Utc>,
}

impl TransmissionPayload {
    pub fn new(message: ServiceMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            source: None,
            max_processing_time: None,
            options: ProcessOptions::default(),
            received_at: Utc::now(),
        }
    }

    pub fn from_source(message: ServiceMessage, source: impl Into<String>) -> Self {
        let mut payload = Self::new(message);
        payload.source = Some(source.into());
        payload
    }

    pub fn with_max_processing_time(mut self, ttl: Duration) -> Self {
        self.max_processing_time = Some(ttl);
        self
    }

    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.message.header.channel_id
    }
}
