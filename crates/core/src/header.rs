//! Message addressing: the three-part header carried by every message and
//! the filters commands register against it.
//!
//! All parts are normalised to lowercase on construction so that matching is
//! case-insensitive regardless of how a transport spells a channel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Routing header: `(channel, message type, action type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceMessageHeader {
    pub channel_id: String,
    pub message_type: String,
    /// Optional action within the message type.
    pub action_type: Option<String>,
}

impl ServiceMessageHeader {
    pub fn new(
        channel_id: impl AsRef<str>,
        message_type: impl AsRef<str>,
        action_type: Option<&str>,
    ) -> Self {
        Self {
            channel_id: normalise(channel_id.as_ref()),
            message_type: normalise(message_type.as_ref()),
            action_type: action_type.map(normalise).filter(|a| !a.is_empty()),
        }
    }

    /// Header with an action part.
    pub fn action(
        channel_id: impl AsRef<str>,
        message_type: impl AsRef<str>,
        action_type: impl AsRef<str>,
    ) -> Self {
        Self::new(channel_id, message_type, Some(action_type.as_ref()))
    }

    /// Exact filter that matches only this header.
    pub fn to_filter(&self) -> MessageFilter {
        MessageFilter {
            channel_id: self.channel_id.clone(),
            message_type: Some(self.message_type.clone()),
            action_type: self.action_type.clone(),
            exact: true,
        }
    }
}

impl fmt::Display for ServiceMessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.channel_id,
            self.message_type,
            self.action_type.as_deref().unwrap_or("")
        )
    }
}

/// How closely a filter matched a header. Higher is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchSpecificity {
    /// Filter named only the channel.
    Channel,
    /// Filter named channel and message type, any action.
    MessageType,
    /// Filter named all three parts.
    Exact,
}

/// A handler registration key.
///
/// Partial filters match structurally: a channel-only filter matches every
/// message on that channel, a channel + type filter matches every action of
/// that type. Matching never falls back to string prefixes, so `"cha1"` is
/// not matched by a filter on channel `"cha"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFilter {
    pub channel_id: String,
    pub message_type: Option<String>,
    pub action_type: Option<String>,
    /// Exact filters compare the whole header, including an absent action.
    exact: bool,
}

impl MessageFilter {
    /// Build a filter. A missing action makes the filter partial; a missing
    /// message type widens it to the whole channel.
    ///
    /// Returns an error when the channel is empty or an action is given
    /// without a message type.
    pub fn new(
        channel_id: impl AsRef<str>,
        message_type: Option<&str>,
        action_type: Option<&str>,
    ) -> Result<Self, CoreError> {
        let channel_id = normalise(channel_id.as_ref());
        if channel_id.is_empty() {
            return Err(CoreError::Config(
                "message filter requires a channel".into(),
            ));
        }
        let message_type = message_type.map(normalise).filter(|t| !t.is_empty());
        let action_type = action_type.map(normalise).filter(|a| !a.is_empty());
        if action_type.is_some() && message_type.is_none() {
            return Err(CoreError::Config(format!(
                "message filter on channel '{channel_id}' has an action but no message type"
            )));
        }
        let exact = action_type.is_some();
        Ok(Self {
            channel_id,
            message_type,
            action_type,
            exact,
        })
    }

    /// Filter matching every message on a channel.
    pub fn channel(channel_id: impl AsRef<str>) -> Result<Self, CoreError> {
        Self::new(channel_id, None, None)
    }

    pub fn is_partial(&self) -> bool {
        !self.exact
    }

    /// Test the filter against a header.
    pub fn matches(&self, header: &ServiceMessageHeader) -> Option<MatchSpecificity> {
        if self.channel_id != header.channel_id {
            return None;
        }
        let Some(message_type) = &self.message_type else {
            return Some(MatchSpecificity::Channel);
        };
        if *message_type != header.message_type {
            return None;
        }
        if !self.exact {
            return Some(MatchSpecificity::MessageType);
        }
        (self.action_type == header.action_type).then_some(MatchSpecificity::Exact)
    }

    /// The single header an exact filter matches; `None` for partial filters.
    pub fn exact_header(&self) -> Option<ServiceMessageHeader> {
        if !self.exact {
            return None;
        }
        Some(ServiceMessageHeader {
            channel_id: self.channel_id.clone(),
            message_type: self.message_type.clone()?,
            action_type: self.action_type.clone(),
        })
    }

    /// Whether this filter can ever match a message on `channel_id`.
    pub fn supports_channel(&self, channel_id: &str) -> bool {
        self.channel_id.eq_ignore_ascii_case(channel_id)
    }
}

impl fmt::Display for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.channel_id,
            self.message_type.as_deref().unwrap_or("*"),
            self.action_type.as_deref().unwrap_or("*")
        )
    }
}

fn normalise(part: &str) -> String {
    part.trim().to_lowercase()
}
