use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CommsError;

/// Listener polling and sender settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationPolicy {
    /// Interval between scheduled priority recalculations.
    #[serde(default = "default_recalculate_interval_secs")]
    pub recalculate_interval_secs: u64,
    /// Most payloads a single poll may request.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Budget for one poll before the task manager cancels it.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Only poll listeners whose channel a registered command supports.
    #[serde(default = "default_listen_supported_only")]
    pub listen_supported_only: bool,
}

fn default_recalculate_interval_secs() -> u64 { 600 }
fn default_max_batch() -> usize { 10 }
fn default_poll_timeout_secs() -> u64 { 30 }
fn default_listen_supported_only() -> bool { true }

impl Default for CommunicationPolicy {
    fn default() -> Self {
        Self {
            recalculate_interval_secs: default_recalculate_interval_secs(),
            max_batch: default_max_batch(),
            poll_timeout_secs: default_poll_timeout_secs(),
            listen_supported_only: default_listen_supported_only(),
        }
    }
}

impl CommunicationPolicy {
    pub fn recalculate_interval(&self) -> Duration {
        Duration::from_secs(self.recalculate_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), CommsError> {
        if self.recalculate_interval_secs == 0 {
            return Err(CommsError::Config(
                "recalculate_interval_secs must be positive".into(),
            ));
        }
        if self.max_batch == 0 {
            return Err(CommsError::Config("max_batch must be positive".into()));
        }
        if self.poll_timeout_secs == 0 {
            return Err(CommsError::Config("poll_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_recalculate_every_ten_minutes() {
        let p = CommunicationPolicy::default();
        assert_eq!(p.recalculate_interval(), Duration::from_secs(600));
        p.validate().unwrap();
    }

    #[test]
    fn zero_batch_is_rejected() {
        let p = CommunicationPolicy {
            max_batch: 0,
            ..Default::default()
        };
        assert!(matches!(p.validate(), Err(CommsError::Config(_))));
    }
}
