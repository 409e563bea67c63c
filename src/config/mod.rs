//! Runtime configuration for the session bridge.
//!
//! Values are layered with increasing precedence:
//!
//! 1. Hardcoded defaults
//! 2. A TOML configuration file (`BridgeConfig::load`)
//! 3. Environment variables (`QCHAT_BRIDGE_*`, see `merge_env_vars`)

use crate::error::{BridgeError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "QCHAT_BRIDGE_";

/// Configuration for process supervision, output parsing and session housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long to wait for the child to confirm it started.
    #[serde(with = "humantime_serde")]
    pub start_timeout: Duration,

    /// Delay between SIGTERM and SIGKILL.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Idle time after which a partial output line is force-flushed.
    #[serde(with = "humantime_serde")]
    pub line_flush_delay: Duration,

    /// Initialization banner flush delay once the completion marker was seen.
    #[serde(with = "humantime_serde")]
    pub init_complete_delay: Duration,

    /// Initialization banner flush delay for any other banner line.
    #[serde(with = "humantime_serde")]
    pub init_idle_delay: Duration,

    /// Report pending stdio streams this long after the process exited.
    #[serde(with = "humantime_serde")]
    pub stdio_timeout: Duration,

    /// Report a process that has not exited this long after its streams closed.
    #[serde(with = "humantime_serde")]
    pub process_exit_timeout: Duration,

    /// Grace window before a terminated session is removed from the registry.
    #[serde(with = "humantime_serde")]
    pub removal_grace: Duration,

    /// Identical stderr info messages within this window are suppressed.
    #[serde(with = "humantime_serde")]
    pub info_dedup_window: Duration,

    /// Sessions without activity for this long are terminated by the idle sweep.
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Duration,

    /// Period of the idle sweep.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Period of resource sampling; zero disables sampling.
    #[serde(with = "humantime_serde")]
    pub resource_sample_interval: Duration,

    /// Environment applied to every child on top of the inherited one.
    pub env_overrides: BTreeMap<String, String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
            line_flush_delay: Duration::from_millis(200),
            init_complete_delay: Duration::from_millis(1000),
            init_idle_delay: Duration::from_millis(15000),
            stdio_timeout: Duration::from_secs(10),
            process_exit_timeout: Duration::from_secs(10),
            removal_grace: Duration::from_secs(5),
            info_dedup_window: Duration::from_secs(2),
            inactivity_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            resource_sample_interval: Duration::from_secs(30),
            env_overrides: default_env_overrides(),
        }
    }
}

/// Pager and color suppression for the wrapped CLI.
fn default_env_overrides() -> BTreeMap<String, String> {
    [
        ("PAGER", "cat"),
        ("GIT_PAGER", "cat"),
        ("NO_COLOR", "1"),
        ("CLICOLOR", "0"),
        ("FORCE_COLOR", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl BridgeConfig {
    /// Parse a configuration from TOML text; missing fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, BridgeError> {
        let config: Self = toml::from_str(contents).map_err(|e| {
            BridgeError::config_with_code(ErrorCode::CONFIG_PARSE_ERROR, e.to_string())
                .with_source(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config_with_code(
                ErrorCode::CONFIG_NOT_FOUND,
                format!("Cannot read config file {}", path.display()),
            )
            .with_source(e)
        })?;
        tracing::debug!("Loaded bridge configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Apply `QCHAT_BRIDGE_*` environment overrides from the process environment.
    pub fn merge_env_vars(&mut self) -> Result<(), BridgeError> {
        self.merge_env_from(std::env::vars())
    }

    /// Apply overrides from an explicit list of variables.
    pub fn merge_env_from<I>(&mut self, vars: I) -> Result<(), BridgeError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let slot = match name {
                "START_TIMEOUT" => &mut self.start_timeout,
                "KILL_GRACE" => &mut self.kill_grace,
                "LINE_FLUSH_DELAY" => &mut self.line_flush_delay,
                "INIT_COMPLETE_DELAY" => &mut self.init_complete_delay,
                "INIT_IDLE_DELAY" => &mut self.init_idle_delay,
                "STDIO_TIMEOUT" => &mut self.stdio_timeout,
                "PROCESS_EXIT_TIMEOUT" => &mut self.process_exit_timeout,
                "REMOVAL_GRACE" => &mut self.removal_grace,
                "INFO_DEDUP_WINDOW" => &mut self.info_dedup_window,
                "INACTIVITY_TIMEOUT" => &mut self.inactivity_timeout,
                "SWEEP_INTERVAL" => &mut self.sweep_interval,
                "RESOURCE_SAMPLE_INTERVAL" => &mut self.resource_sample_interval,
                _ => {
                    tracing::trace!("Ignoring unknown override {}", key);
                    continue;
                }
            };
            *slot = parse_duration(&key, &value)?;
        }
        self.validate()
    }

    /// Reject values that would make timers spin or never fire.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let required = [
            ("start_timeout", self.start_timeout),
            ("line_flush_delay", self.line_flush_delay),
            ("init_complete_delay", self.init_complete_delay),
            ("init_idle_delay", self.init_idle_delay),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in required {
            if value.is_zero() {
                return Err(BridgeError::config_with_code(
                    ErrorCode::CONFIG_INVALID_VALUE,
                    format!("{name} must be greater than zero"),
                ));
            }
        }
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, BridgeError> {
    humantime_serde::re::humantime::parse_duration(value.trim()).map_err(|e| {
        BridgeError::config_with_code(
            ErrorCode::CONFIG_INVALID_VALUE,
            format!("{key}: invalid duration '{value}'"),
        )
        .with_source(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_timings() {
        let config = BridgeConfig::default();
        assert_eq!(config.start_timeout, Duration::from_secs(30));
        assert_eq!(config.kill_grace, Duration::from_secs(5));
        assert_eq!(config.line_flush_delay, Duration::from_millis(200));
        assert_eq!(config.init_complete_delay, Duration::from_secs(1));
        assert_eq!(config.init_idle_delay, Duration::from_secs(15));
        assert_eq!(config.env_overrides.get("PAGER").map(String::as_str), Some("cat"));
        assert_eq!(config.env_overrides.get("NO_COLOR").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            kill_grace = "2s"
            line_flush_delay = "50ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.kill_grace, Duration::from_secs(2));
        assert_eq!(config.line_flush_delay, Duration::from_millis(50));
        assert_eq!(config.start_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = BridgeConfig::from_toml_str("kill_grace = [").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_PARSE_ERROR);
    }

    #[test]
    fn test_zero_flush_delay_rejected() {
        let err = BridgeConfig::from_toml_str(r#"line_flush_delay = "0s""#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_VALUE);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BridgeConfig::default();
        config
            .merge_env_from(vec![
                ("QCHAT_BRIDGE_KILL_GRACE".to_string(), "750ms".to_string()),
                ("QCHAT_BRIDGE_UNKNOWN".to_string(), "1s".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();
        assert_eq!(config.kill_grace, Duration::from_millis(750));

        let err = config
            .merge_env_from(vec![(
                "QCHAT_BRIDGE_START_TIMEOUT".to_string(),
                "soon".to_string(),
            )])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_VALUE);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "removal_grace = \"1s\"\n").unwrap();
        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.removal_grace, Duration::from_secs(1));

        let missing = BridgeConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::CONFIG_NOT_FOUND);
    }
}
