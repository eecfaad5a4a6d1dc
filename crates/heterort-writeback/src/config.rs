//! Write-back engine configuration.
//!
//! Loads [`WriteBackConfig`] from a TOML file with environment variable
//! overrides via `HETERORT_WRITEBACK_*` prefixed variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Upper bound for the per-record history capacity hint.
pub const MAX_HISTORY_CAPACITY: usize = 65_536;

/// Engine configuration loaded from TOML with environment variable overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBackConfig {
    /// Whether teardown waits for the copy back to finish.
    /// Override: `HETERORT_WRITEBACK_BLOCKING`
    pub blocking_teardown: bool,

    /// Initial history capacity per record. Histories grow past this; it is
    /// never used to drop events.
    /// Override: `HETERORT_WRITEBACK_HISTORY_CAPACITY`
    pub history_capacity: usize,

    /// Emit a debug event for every write-back decision.
    /// Override: `HETERORT_WRITEBACK_LOG_DECISIONS`
    pub log_decisions: bool,
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self { blocking_teardown: true, history_capacity: 8, log_decisions: true }
    }
}

impl WriteBackConfig {
    /// Generate a default configuration TOML string.
    pub fn default_toml() -> String {
        let cfg = Self::default();
        toml::to_string_pretty(&cfg).unwrap_or_default()
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: WriteBackConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Validation("history_capacity must be > 0".into()));
        }
        if self.history_capacity > MAX_HISTORY_CAPACITY {
            return Err(ConfigError::Validation(format!(
                "history_capacity must be <= {MAX_HISTORY_CAPACITY}, got {}",
                self.history_capacity
            )));
        }
        Ok(())
    }

    /// Apply `HETERORT_WRITEBACK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("HETERORT_WRITEBACK_BLOCKING") {
            self.blocking_teardown = parse_flag("HETERORT_WRITEBACK_BLOCKING", &val)?;
        }

        if let Ok(val) = std::env::var("HETERORT_WRITEBACK_HISTORY_CAPACITY") {
            self.history_capacity = val.parse::<usize>().map_err(|e| ConfigError::EnvOverride {
                key: "HETERORT_WRITEBACK_HISTORY_CAPACITY".into(),
                value: val.clone(),
                reason: e.to_string(),
            })?;
        }

        if let Ok(val) = std::env::var("HETERORT_WRITEBACK_LOG_DECISIONS") {
            self.log_decisions = parse_flag("HETERORT_WRITEBACK_LOG_DECISIONS", &val)?;
        }

        Ok(())
    }
}

fn parse_flag(key: &str, val: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val.into(),
            reason: "expected a boolean (1/0, true/false, yes/no, on/off)".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        let cfg = WriteBackConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.blocking_teardown);
        assert_eq!(cfg.history_capacity, 8);
    }

    #[test]
    fn default_toml_parses_back() {
        let text = WriteBackConfig::default_toml();
        let cfg: WriteBackConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg, WriteBackConfig::default());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let cfg = WriteBackConfig { history_capacity: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        let cfg = WriteBackConfig { history_capacity: MAX_HISTORY_CAPACITY + 1, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert!(parse_flag("K", "YES").unwrap());
        assert!(!parse_flag("K", "off").unwrap());
        assert!(matches!(parse_flag("K", "maybe"), Err(ConfigError::EnvOverride { .. })));
    }
}
