use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Master-job negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterJobPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Channel the negotiation runs on. Required when enabled.
    #[serde(default)]
    pub negotiation_channel: Option<String>,
    #[serde(default = "default_negotiation_message_type")]
    pub negotiation_message_type: String,
    #[serde(default = "default_negotiation_priority")]
    pub negotiation_priority: u8,
    /// Unanswered polls after which an inactive instance starts negotiating.
    #[serde(default = "default_inactive_poll_threshold")]
    pub inactive_poll_threshold: u32,
    #[serde(default = "default_negotiating_poll_min_secs")]
    pub negotiating_poll_min_secs: u64,
    #[serde(default = "default_negotiating_poll_max_secs")]
    pub negotiating_poll_max_secs: u64,
    #[serde(default = "default_active_poll_min_secs")]
    pub active_poll_min_secs: u64,
    #[serde(default = "default_active_poll_max_secs")]
    pub active_poll_max_secs: u64,
    /// Upper bound on the inactive backoff interval.
    #[serde(default = "default_inactive_backoff_cap_secs")]
    pub inactive_backoff_cap_secs: u64,
}

fn default_negotiation_message_type() -> String { "masterjob".to_string() }
fn default_negotiation_priority() -> u8 { 2 }
fn default_inactive_poll_threshold() -> u32 { 3 }
fn default_negotiating_poll_min_secs() -> u64 { 5 }
fn default_negotiating_poll_max_secs() -> u64 { 15 }
fn default_active_poll_min_secs() -> u64 { 5 }
fn default_active_poll_max_secs() -> u64 { 30 }
fn default_inactive_backoff_cap_secs() -> u64 { 60 }

impl Default for MasterJobPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            negotiation_channel: None,
            negotiation_message_type: default_negotiation_message_type(),
            negotiation_priority: default_negotiation_priority(),
            inactive_poll_threshold: default_inactive_poll_threshold(),
            negotiating_poll_min_secs: default_negotiating_poll_min_secs(),
            negotiating_poll_max_secs: default_negotiating_poll_max_secs(),
            active_poll_min_secs: default_active_poll_min_secs(),
            active_poll_max_secs: default_active_poll_max_secs(),
            inactive_backoff_cap_secs: default_inactive_backoff_cap_secs(),
        }
    }
}

impl MasterJobPolicy {
    pub fn negotiating_window(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.negotiating_poll_min_secs),
            Duration::from_secs(self.negotiating_poll_max_secs),
        )
    }

    pub fn active_window(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.active_poll_min_secs),
            Duration::from_secs(self.active_poll_max_secs),
        )
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if !self.enabled {
            return Ok(());
        }
        if self.negotiation_channel.as_deref().map_or(true, str::is_empty) {
            return Err(CommandError::Config(
                "master job enabled without a negotiation channel".into(),
            ));
        }
        if self.negotiation_message_type.trim().is_empty() {
            return Err(CommandError::Config(
                "master job negotiation message type is empty".into(),
            ));
        }
        if self.inactive_poll_threshold == 0 {
            return Err(CommandError::Config(
                "master job inactive_poll_threshold must be at least 1".into(),
            ));
        }
        if self.negotiating_poll_min_secs > self.negotiating_poll_max_secs
            || self.active_poll_min_secs > self.active_poll_max_secs
        {
            return Err(CommandError::Config(
                "master job poll window has min above max".into(),
            ));
        }
        Ok(())
    }
}

/// Per-command settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPolicy {
    #[serde(default = "default_outgoing_enabled")]
    pub outgoing_requests_enabled: bool,
    /// Channel responses to this command's requests arrive on. Required when
    /// outgoing requests are enabled.
    #[serde(default)]
    pub response_channel: Option<String>,
    #[serde(default = "default_response_message_type")]
    pub response_message_type: String,
    #[serde(default = "default_outgoing_ttl_secs")]
    pub outgoing_request_ttl_secs: u64,
    #[serde(default = "default_outgoing_sweep_ms")]
    pub outgoing_sweep_interval_ms: u64,
    #[serde(default)]
    pub master_job: MasterJobPolicy,
}

fn default_outgoing_enabled() -> bool { false }
fn default_response_message_type() -> String { "response".to_string() }
fn default_outgoing_ttl_secs() -> u64 { 30 }
fn default_outgoing_sweep_ms() -> u64 { 1000 }

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            outgoing_requests_enabled: default_outgoing_enabled(),
            response_channel: None,
            response_message_type: default_response_message_type(),
            outgoing_request_ttl_secs: default_outgoing_ttl_secs(),
            outgoing_sweep_interval_ms: default_outgoing_sweep_ms(),
            master_job: MasterJobPolicy::default(),
        }
    }
}

impl CommandPolicy {
    pub fn outgoing_request_ttl(&self) -> Duration {
        Duration::from_secs(self.outgoing_request_ttl_secs)
    }

    pub fn outgoing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.outgoing_sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.outgoing_requests_enabled
            && self.response_channel.as_deref().map_or(true, str::is_empty)
        {
            return Err(CommandError::Config(
                "outgoing requests enabled without a response channel".into(),
            ));
        }
        if self.outgoing_sweep_interval_ms == 0 {
            return Err(CommandError::Config(
                "outgoing_sweep_interval_ms must be positive".into(),
            ));
        }
        self.master_job.validate()
    }
}
