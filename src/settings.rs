//! Tool settings
//!
//! Settings are layered: built in defaults, then an optional YAML file,
//! then environment variables, then command line flags applied by the
//! binary.

use crate::consumer::policy::parse_duration;
use crate::consumer::validate::{bypass_requested, NO_VALIDATE_ENV};
use crate::error::{ConsumerError, ConsumerResult, ErrorContext};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default broker address
pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Durations in settings files are written like `5s` or `1m30s`
mod duration_str {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_nanos() == 0 {
            s.serialize_str(&format!("{}s", d.as_secs()))
        } else {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines instead of plain text
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            json: false,
        }
    }
}

/// Settings shared by every command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker URL
    pub server: String,

    /// Request timeout and pull expiry
    #[serde(with = "duration_str")]
    pub timeout: Duration,

    /// Skip configuration validation
    pub no_validate: bool,

    /// Apply pull mode ack normalization to configurations loaded from files
    pub normalize_file_configs: bool,

    /// Log every API request and response
    pub trace: bool,

    /// Logging
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            timeout: Duration::from_secs(5),
            no_validate: false,
            normalize_file_configs: false,
            trace: false,
            log: LogSettings::default(),
        }
    }
}

fn env_flag(value: &str) -> bool {
    !matches!(value.trim().to_lowercase().as_str(), "" | "0" | "false" | "no" | "off")
}

impl Settings {
    /// Read settings from a YAML file, filling gaps with defaults
    pub fn from_file(path: impl AsRef<Path>) -> ConsumerResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(ConsumerError::from)
            .with_context(|| format!("could not read settings {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&data)
            .map_err(|e| ConsumerError::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "loaded settings file");
        Ok(settings)
    }

    /// Apply environment overrides using the process environment
    pub fn with_env(self) -> ConsumerResult<Self> {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides from an arbitrary lookup
    pub fn with_env_from<F>(mut self, lookup: F) -> ConsumerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup("JETCTL_SERVER").or_else(|| lookup("NATS_URL")) {
            self.server = server;
        }

        if let Some(timeout) = lookup("JETCTL_TIMEOUT") {
            self.timeout = parse_duration(&timeout)
                .map_err(|e| ConsumerError::Config(format!("JETCTL_TIMEOUT: {}", e)))?;
        }

        if let Some(v) = lookup(NO_VALIDATE_ENV) {
            self.no_validate = bypass_requested(&v);
        }

        if let Some(v) = lookup("JETCTL_NORMALIZE_FILE_CONFIGS") {
            self.normalize_file_configs = env_flag(&v);
        }

        if let Some(level) = lookup("JETCTL_LOG_LEVEL") {
            self.log.level = level;
        }

        Ok(self)
    }

    /// Defaults, then `file` if given, then the environment
    pub fn load(file: Option<&Path>) -> ConsumerResult<Self> {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let settings = base.with_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Logging settings with API tracing applied
    ///
    /// Tracing raises this crate to at least debug so request and response
    /// lines are shown whatever the configured level.
    pub fn effective_log(&self) -> LogSettings {
        let mut log = self.log.clone();
        if !self.trace {
            return log;
        }

        let level = log.level.to_lowercase();
        let verbose = matches!(level.as_str(), "debug" | "trace")
            || level.contains("jetctl=debug")
            || level.contains("jetctl=trace");
        if !verbose {
            log.level = format!("{},jetctl=debug", log.level);
        }
        log
    }

    /// Check the settings are usable
    pub fn validate(&self) -> ConsumerResult<()> {
        if self.server.trim().is_empty() {
            return Err(ConsumerError::Config("server cannot be empty".to_string()));
        }

        if self.timeout.is_zero() {
            return Err(ConsumerError::Config("timeout must be greater than 0".to_string()));
        }

        let level = self.log.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) && !level.contains('=') {
            return Err(ConsumerError::Config(format!("unknown log level '{}'", self.log.level)));
        }

        Ok(())
    }
}
