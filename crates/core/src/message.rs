use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::header::ServiceMessageHeader;
use crate::identity::ServiceIdentity;

/// Response status carried on reply messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Ok,
    NotFound,
    NotSupported,
    Timeout,
    Error,
}

impl MessageStatus {
    /// HTTP-flavoured numeric code, for dashboards and logs.
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::NotFound => 404,
            Self::NotSupported => 501,
            Self::Timeout => 408,
            Self::Error => 500,
        }
    }
}

/// Message envelope exchanged between services.
///
/// Bodies are MessagePack-encoded. `originator_key` identifies this message
/// as a request; a reply carries that key back in `correlation_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMessage {
    pub id: Uuid,

    /// Where this message is routed.
    pub header: ServiceMessageHeader,

    /// Where the receiver should route its reply, if one is expected.
    #[serde(default)]
    pub response_header: Option<ServiceMessageHeader>,

    /// Key unique to this message, used as the correlation id of replies.
    pub originator_key: String,

    /// Set on replies: the `originator_key` of the request being answered.
    #[serde(default)]
    pub correlation_key: Option<String>,

    /// Service id of the sender.
    pub originator_service_id: String,

    /// Set on replies.
    #[serde(default)]
    pub status: Option<MessageStatus>,

    #[serde(default)]
    pub status_description: Option<String>,

    /// Transport priority hint; higher is more urgent.
    #[serde(default)]
    pub channel_priority: u8,

    /// Delivered from a dead-letter queue.
    #[serde(default)]
    pub dead_letter: bool,

    /// MessagePack body, carried as a binary string.
    #[serde(with = "serde_bytes", default)]
    pub body: Vec<u8>,

    pub created_at: DateTime<Utc>,
}

impl ServiceMessage {
    /// New message with an empty body.
    pub fn empty(header: ServiceMessageHeader, originator: &ServiceIdentity) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            header,
            response_header: None,
            originator_key: id.simple().to_string(),
            correlation_key: None,
            originator_service_id: originator.service_id.clone(),
            status: None,
            status_description: None,
            channel_priority: 1,
            dead_letter: false,
            body: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// New message, serializing the body with MessagePack.
    pub fn new<T: Serialize>(
        header: ServiceMessageHeader,
        originator: &ServiceIdentity,
        body: &T,
    ) -> Result<Self, CoreError> {
        let mut message = Self::empty(header, originator);
        message.body = rmp_serde::to_vec_named(body)?;
        Ok(message)
    }

    /// Replace the body.
    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self, CoreError> {
        self.body = rmp_serde::to_vec_named(body)?;
        Ok(self)
    }

    pub fn with_response_header(mut self, header: ServiceMessageHeader) -> Self {
        self.response_header = Some(header);
        self
    }

    /// Deserialize the body into the expected type.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, CoreError> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }

    /// Correlation id as tracked by outgoing-request bookkeeping.
    pub fn correlation_id(&self) -> Option<String> {
        self.correlation_key.as_deref().map(str::to_uppercase)
    }

    /// Id under which a request sent with this message is tracked.
    pub fn request_id(&self) -> String {
        self.originator_key.to_uppercase()
    }

    /// Build the reply to this message.
    ///
    /// The reply is addressed to `response_header` when the request named one,
    /// otherwise back to the request's own header.
    pub fn to_response(&self, responder: &ServiceIdentity, status: MessageStatus) -> Self {
        let header = self
            .response_header
            .clone()
            .unwrap_or_else(|| self.header.clone());
        let mut reply = Self::empty(header, responder);
        reply.correlation_key = Some(self.originator_key.clone());
        reply.status = Some(status);
        reply.channel_priority = self.channel_priority;
        reply
    }

    pub fn is_response(&self) -> bool {
        self.correlation_key.is_some()
    }

    /// Serialize this entire envelope to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
