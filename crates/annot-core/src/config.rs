//! Engine configuration.
//!
//! Plain `key=value` lines, `#` comments, optional quotes around values.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Upper bound on a single batch claim.
pub const MAX_CLAIM_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("{key} must be at least 1")]
    ZeroValue { key: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Claim, retry and fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts allowed per overlay before it stays failed.
    pub max_attempts: u32,
    /// Claims older than this may be reclaimed.
    pub lease_duration_sec: u64,
    /// Default size for batch claims; clamped to `1..=MAX_CLAIM_BATCH_SIZE`.
    pub claim_batch_size: u32,
    /// How often the reaper looks for expired leases; 0 disables it.
    pub reap_interval_sec: u64,
    pub allow_reopen_confirmed: bool,
    /// Per-run broadcast buffer; slower subscribers are told to resync.
    pub fanout_capacity: usize,
    /// Outbox poll fallback when no commit notification arrives.
    pub relay_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lease_duration_sec: 300,
            claim_batch_size: 25,
            reap_interval_sec: 30,
            allow_reopen_confirmed: false,
            fanout_capacity: 1024,
            relay_poll_ms: 250,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "max_attempts" => self.max_attempts = Self::parse_positive(key, value)?,
            "lease_duration_sec" => self.lease_duration_sec = Self::parse_positive(key, value)?,
            "claim_batch_size" => {
                let size: u32 = Self::parse_positive(key, value)?;
                self.claim_batch_size = size.min(MAX_CLAIM_BATCH_SIZE);
            }
            "reap_interval_sec" => self.reap_interval_sec = Self::parse_int(key, value)?,
            "allow_reopen_confirmed" => {
                self.allow_reopen_confirmed = Self::parse_bool(key, value)?;
            }
            "fanout_capacity" => self.fanout_capacity = Self::parse_positive(key, value)?,
            "relay_poll_ms" => self.relay_poll_ms = Self::parse_positive(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + Default + PartialEq,
    {
        let parsed: T = Self::parse_int(key, value)?;
        if parsed == T::default() {
            return Err(ConfigError::ZeroValue {
                key: key.to_string(),
            });
        }
        Ok(parsed)
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_duration_sec)
    }

    /// None when reaping is disabled.
    pub fn reap_interval(&self) -> Option<Duration> {
        (self.reap_interval_sec > 0).then(|| Duration::from_secs(self.reap_interval_sec))
    }

    pub fn relay_poll(&self) -> Duration {
        Duration::from_millis(self.relay_poll_ms)
    }

    /// Resolves a requested batch size against the configured default.
    pub fn batch_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.claim_batch_size)
            .clamp(1, MAX_CLAIM_BATCH_SIZE)
    }
}
