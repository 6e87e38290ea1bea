//! Configuration for the shutdown sequence.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding [`GracefulConfig::cleanup_timeout_secs`].
pub const ENV_CLEANUP_TIMEOUT: &str = "GRACEFUL_CLEANUP_TIMEOUT_SECS";
/// Environment variable overriding [`GracefulConfig::cleanup_grace_secs`].
pub const ENV_CLEANUP_GRACE: &str = "GRACEFUL_CLEANUP_GRACE_SECS";
/// Environment variable overriding [`GracefulConfig::handle_signals`].
pub const ENV_HANDLE_SIGNALS: &str = "GRACEFUL_HANDLE_SIGNALS";

/// Settings for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GracefulConfig {
    /// Budget given to cleanup callables, in seconds. Their scope is
    /// cancelled when it runs out.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_secs: f64,
    /// Extra time, in seconds, to collect cleanup results after the
    /// deadline fired before giving up on callables that ignore it.
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_secs: f64,
    /// Whether to listen for OS termination signals.
    #[serde(default = "default_handle_signals")]
    pub handle_signals: bool,
}

fn default_cleanup_timeout() -> f64 {
    10.0
}

fn default_cleanup_grace() -> f64 {
    0.5
}

fn default_handle_signals() -> bool {
    true
}

impl Default for GracefulConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout_secs: default_cleanup_timeout(),
            cleanup_grace_secs: default_cleanup_grace(),
            handle_signals: default_handle_signals(),
        }
    }
}

impl GracefulConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cleanup timeout.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, seconds: f64) -> Self {
        self.cleanup_timeout_secs = seconds;
        self
    }

    /// Sets the cleanup grace period.
    #[must_use]
    pub fn with_cleanup_grace(mut self, seconds: f64) -> Self {
        self.cleanup_grace_secs = seconds;
        self
    }

    /// Enables or disables OS signal handling.
    #[must_use]
    pub fn with_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Returns the cleanup timeout as a duration.
    ///
    /// Invalid values fall back to the default; call [`validate`](Self::validate)
    /// to reject them instead.
    #[must_use]
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.cleanup_timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_cleanup_timeout()))
    }

    /// Returns the cleanup grace period as a duration.
    #[must_use]
    pub fn cleanup_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.cleanup_grace_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_cleanup_grace()))
    }

    /// Checks that every duration is finite and non-negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("cleanup_timeout_secs", self.cleanup_timeout_secs)?;
        check_secs("cleanup_grace_secs", self.cleanup_grace_secs)?;
        Ok(())
    }

    /// Builds a configuration from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_CLEANUP_TIMEOUT) {
            config.cleanup_timeout_secs = parse_secs(ENV_CLEANUP_TIMEOUT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CLEANUP_GRACE) {
            config.cleanup_grace_secs = parse_secs(ENV_CLEANUP_GRACE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_HANDLE_SIGNALS) {
            config.handle_signals = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: ENV_HANDLE_SIGNALS,
                        value: raw,
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }
}

fn check_secs(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidDuration { field, value })
    }
}

fn parse_secs(var: &'static str, raw: &str) -> Result<f64, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: raw.to_string(),
    })
}
