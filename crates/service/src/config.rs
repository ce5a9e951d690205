//! Service configuration: one TOML document holding the task manager,
//! communication and per-command policies, followed by environment
//! overrides (`STELLWERK_SECTION_KEY`, profile-aware) and validation.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use stellwerk_command::CommandPolicy;
use stellwerk_comms::CommunicationPolicy;
use stellwerk_core::config::{active_profile, override_from_env, override_opt_from_env};
use stellwerk_core::ServiceIdentity;
use stellwerk_tasks::TaskManagerPolicy;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Unique per instance. Generated from `name` when absent.
    #[serde(default)]
    pub service_id: Option<String>,
    /// Port for the `/statistics` endpoint. Disabled when absent.
    #[serde(default)]
    pub statistics_port: Option<u16>,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_service_name() -> String {
    "stellwerk".to_string()
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            service_id: None,
            statistics_port: None,
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub tasks: TaskManagerPolicy,
    #[serde(default)]
    pub comms: CommunicationPolicy,
    /// Policies by command name. Commands without an entry use defaults.
    #[serde(default)]
    pub commands: HashMap<String, CommandPolicy>,
}

impl ServiceConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ServiceError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ServiceError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        let p = active_profile();
        let s = &mut self.service;
        override_from_env(&p, "STELLWERK_SERVICE_NAME", &mut s.name);
        override_opt_from_env(&p, "STELLWERK_SERVICE_ID", &mut s.service_id);
        override_opt_from_env(&p, "STELLWERK_SERVICE_STATISTICS_PORT", &mut s.statistics_port);
        override_from_env(&p, "STELLWERK_SERVICE_JSON_LOGS", &mut s.json_logs);

        let t = &mut self.tasks;
        override_from_env(&p, "STELLWERK_TASKS_PRIORITY_LEVELS", &mut t.priority_levels);
        override_from_env(&p, "STELLWERK_TASKS_MAX_CONCURRENT", &mut t.max_concurrent);
        override_from_env(&p, "STELLWERK_TASKS_MIN_CONCURRENT", &mut t.min_concurrent);
        override_from_env(&p, "STELLWERK_TASKS_LOOP_POLL_INTERVAL_MS", &mut t.loop_poll_interval_ms);
        override_from_env(&p, "STELLWERK_TASKS_KILL_GRACE_SECS", &mut t.kill_grace_secs);
        override_from_env(&p, "STELLWERK_TASKS_AUTOTUNE_ENABLED", &mut t.autotune.enabled);
        override_from_env(
            &p,
            "STELLWERK_TASKS_AUTOTUNE_TARGET_CPU_PERCENT",
            &mut t.autotune.target_cpu_percent,
        );

        let c = &mut self.comms;
        override_from_env(
            &p,
            "STELLWERK_COMMS_RECALCULATE_INTERVAL_SECS",
            &mut c.recalculate_interval_secs,
        );
        override_from_env(&p, "STELLWERK_COMMS_MAX_BATCH", &mut c.max_batch);
        override_from_env(&p, "STELLWERK_COMMS_POLL_TIMEOUT_SECS", &mut c.poll_timeout_secs);
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.service.name.trim().is_empty() {
            return Err(ServiceError::Config("service name must not be empty".into()));
        }
        if self.service.service_id.as_deref() == Some("") {
            return Err(ServiceError::Config("service_id must not be empty".into()));
        }
        self.tasks.validate()?;
        self.comms.validate()?;
        for (name, policy) in &self.commands {
            policy
                .validate()
                .map_err(|e| ServiceError::Config(format!("command {name}: {e}")))?;
        }
        Ok(())
    }

    pub fn identity(&self) -> ServiceIdentity {
        match &self.service.service_id {
            Some(id) => ServiceIdentity::new(&self.service.name, id),
            None => ServiceIdentity::generated(&self.service.name),
        }
    }

    pub fn command_policy(&self, name: &str) -> CommandPolicy {
        self.commands.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_toml() {
        let cfg = ServiceConfig::from_toml("").unwrap();
        assert_eq!(cfg.service.name, "stellwerk");
        assert_eq!(cfg.tasks.priority_levels, 4);
        assert_eq!(cfg.comms.recalculate_interval_secs, 600);
        assert!(cfg.commands.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[service]
name = "orders"
service_id = "orders-eu"
statistics_port = 9400

[tasks]
priority_levels = 3
max_concurrent = 16
bulkhead = [{ level = 0, slots = 2 }]

[comms]
max_batch = 5

[commands.billing]
outgoing_requests_enabled = true
response_channel = "billing-replies"

[commands.billing.master_job]
enabled = true
negotiation_channel = "billing-cluster"
"#;
        let cfg = ServiceConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.service.statistics_port, Some(9400));
        assert_eq!(cfg.tasks.bulkhead.len(), 1);
        assert_eq!(cfg.comms.max_batch, 5);

        let billing = cfg.command_policy("billing");
        assert!(billing.outgoing_requests_enabled);
        assert!(billing.master_job.enabled);
        assert_eq!(billing.master_job.negotiation_message_type, "masterjob");
        assert!(!cfg.command_policy("unknown").outgoing_requests_enabled);

        let identity = cfg.identity();
        assert_eq!(identity.service_id, "orders-eu");
    }

    #[test]
    fn invalid_command_policy_is_rejected() {
        let toml = r#"
[commands.billing]
outgoing_requests_enabled = true
"#;
        let err = ServiceConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn invalid_task_policy_is_rejected() {
        let toml = "[tasks]\npriority_levels = 0\n";
        assert!(matches!(
            ServiceConfig::from_toml(toml),
            Err(ServiceError::Task(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            ServiceConfig::from_toml("[service"),
            Err(ServiceError::ConfigParse(_))
        ));
    }

    #[test]
    fn generated_identity_without_service_id() {
        let cfg = ServiceConfig::default();
        let identity = cfg.identity();
        assert!(identity.service_id.starts_with("stellwerk-"));
    }

    #[test]
    fn env_overrides_apply_to_sections() {
        std::env::set_var("STELLWERK_TASKS_KILL_GRACE_SECS", "3");
        let mut cfg = ServiceConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var("STELLWERK_TASKS_KILL_GRACE_SECS");
        assert_eq!(cfg.tasks.kill_grace_secs, 3);
    }
}
