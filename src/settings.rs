//! Process settings: built-in defaults, then `TUNNEL_*` environment
//! variables, then command line flags.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, ensure};
use serde::Deserialize;
use uuid::Uuid;

use crate::constants;
use crate::errors;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub config_path: PathBuf,
    pub metrics_address: String,
    pub grace_period: Duration,
    pub log_level: String,
    pub log_directory: PathBuf,
    pub json_logs: bool,
    pub connector_id: Uuid,
}

/// Values given on the command line. `None` keeps the layered value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub metrics_address: Option<String>,
    pub grace_period: Option<String>,
    pub log_level: Option<String>,
    pub log_directory: Option<PathBuf>,
    pub json_logs: bool,
    pub connector_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct Layered {
    config: PathBuf,
    metrics_address: String,
    grace_period: String,
    log_level: String,
    log_directory: PathBuf,
    json_logs: bool,
    #[serde(default)]
    connector_id: Option<String>,
}

impl AgentSettings {
    /// Layers defaults, the process environment and `overrides`.
    pub fn load(overrides: Overrides) -> anyhow::Result<Self> {
        Self::load_from(None, overrides)
    }

    /// Like [`load`](Self::load), reading variables from `environment`
    /// instead of the process environment when given.
    pub fn load_from(
        environment: Option<HashMap<String, String>>,
        overrides: Overrides,
    ) -> anyhow::Result<Self> {
        let layered: Layered = config::Config::builder()
            .set_default("config", constants::DEFAULT_CONFIG_FILE)?
            .set_default("metrics_address", constants::DEFAULT_METRICS_ADDRESS)?
            .set_default("grace_period", constants::DEFAULT_GRACE_PERIOD)?
            .set_default("log_level", constants::DEFAULT_LOG_LEVEL)?
            .set_default(
                "log_directory",
                constants::default_log_directory().display().to_string(),
            )?
            .set_default("json_logs", false)?
            .add_source(config::Environment::with_prefix(constants::ENV_PREFIX).source(environment))
            .build()
            .context(errors::settings::FAILED_TO_BUILD)?
            .try_deserialize()
            .context(errors::settings::FAILED_TO_BUILD)?;

        let grace_period = overrides.grace_period.unwrap_or(layered.grace_period);
        let connector_id = match (overrides.connector_id, layered.connector_id) {
            (Some(id), _) => id,
            (None, Some(raw)) => Uuid::parse_str(raw.trim())
                .with_context(|| errors::settings::invalid_connector_id(&raw))?,
            (None, None) => Uuid::new_v4(),
        };

        let settings = Self {
            config_path: overrides.config_path.unwrap_or(layered.config),
            metrics_address: overrides.metrics_address.unwrap_or(layered.metrics_address),
            grace_period: humantime::parse_duration(grace_period.trim())
                .with_context(|| errors::settings::invalid_grace_period(&grace_period))?,
            log_level: overrides.log_level.unwrap_or(layered.log_level),
            log_directory: overrides.log_directory.unwrap_or(layered.log_directory),
            json_logs: overrides.json_logs || layered.json_logs,
            connector_id,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            !self.config_path.as_os_str().is_empty(),
            errors::settings::CONFIG_PATH_EMPTY
        );
        ensure!(
            !self.metrics_address.trim().is_empty(),
            errors::settings::METRICS_ADDRESS_EMPTY
        );
        ensure!(
            !self.log_level.trim().is_empty(),
            errors::settings::LOG_LEVEL_EMPTY
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let settings = AgentSettings::load_from(env(&[]), Overrides::default()).unwrap();
        assert_eq!(settings.config_path, PathBuf::from("config.yaml"));
        assert_eq!(settings.metrics_address, "localhost:20241");
        assert_eq!(settings.grace_period, Duration::from_secs(30));
        assert_eq!(settings.log_level, "info");
        assert!(!settings.json_logs);
        assert!(!settings.connector_id.is_nil());
    }

    #[test]
    fn test_environment_layer() {
        let id = Uuid::new_v4();
        let settings = AgentSettings::load_from(
            env(&[
                ("TUNNEL_METRICS_ADDRESS", "0.0.0.0:9000"),
                ("TUNNEL_GRACE_PERIOD", "1m 30s"),
                ("TUNNEL_JSON_LOGS", "true"),
                ("TUNNEL_CONNECTOR_ID", &id.to_string()),
            ]),
            Overrides::default(),
        )
        .unwrap();
        assert_eq!(settings.metrics_address, "0.0.0.0:9000");
        assert_eq!(settings.grace_period, Duration::from_secs(90));
        assert!(settings.json_logs);
        assert_eq!(settings.connector_id, id);
    }

    #[test]
    fn test_flags_override_environment() {
        let settings = AgentSettings::load_from(
            env(&[("TUNNEL_LOG_LEVEL", "warn"), ("TUNNEL_GRACE_PERIOD", "10s")]),
            Overrides {
                log_level: Some("debug".to_string()),
                grace_period: Some("250ms".to_string()),
                config_path: Some(PathBuf::from("/etc/agent/config.yaml")),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.grace_period, Duration::from_millis(250));
        assert_eq!(settings.config_path, PathBuf::from("/etc/agent/config.yaml"));
    }

    #[test]
    fn test_rejects_bad_values() {
        let result = AgentSettings::load_from(
            env(&[("TUNNEL_GRACE_PERIOD", "soon")]),
            Overrides::default(),
        );
        assert!(result.unwrap_err().to_string().contains("soon"));

        let result = AgentSettings::load_from(
            env(&[("TUNNEL_CONNECTOR_ID", "not-a-uuid")]),
            Overrides::default(),
        );
        assert!(result.is_err());

        let result = AgentSettings::load_from(
            env(&[]),
            Overrides {
                metrics_address: Some("  ".to_string()),
                ..Overrides::default()
            },
        );
        assert!(result.is_err());
    }
}
