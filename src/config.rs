use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::json::{deserialize_duration_from_secs, serialize_duration_to_secs};

/// One account's validated configuration.
///
/// The hosting plugin is responsible for loading and defaulting raw user
/// configuration; core components only ever see this typed object.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountConfig {
    /// Base URL of the vendor cloud API.
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// OAuth client identity. Changing it invalidates cached credentials.
    pub client_id: String,
    pub client_secret: String,

    /// Static seed tokens from the vendor app pairing flow. Used once to
    /// bootstrap authorization; afterwards the refreshed credential from the
    /// blob store takes precedence.
    pub token: String,
    pub refresh_token: String,

    /// Appliance state poll interval. May be stretched at runtime to honor
    /// the daily call ceiling.
    #[serde(
        default = "default_status_interval",
        deserialize_with = "deserialize_duration_from_secs",
        serialize_with = "serialize_duration_to_secs"
    )]
    pub status_interval: Duration,

    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration_from_secs",
        serialize_with = "serialize_duration_to_secs"
    )]
    pub request_timeout: Duration,

    #[serde(
        default = "default_backoff_min",
        deserialize_with = "deserialize_duration_from_secs",
        serialize_with = "serialize_duration_to_secs"
    )]
    pub backoff_min: Duration,

    #[serde(
        default = "default_backoff_max",
        deserialize_with = "deserialize_duration_from_secs",
        serialize_with = "serialize_duration_to_secs"
    )]
    pub backoff_max: Duration,

    /// Lead time before credential expiry at which proactive renewal runs.
    #[serde(
        default = "default_refresh_window",
        deserialize_with = "deserialize_duration_from_secs",
        serialize_with = "serialize_duration_to_secs"
    )]
    pub refresh_window: Duration,

    /// Appliance models this account should manage. Empty means all.
    #[serde(default)]
    pub supported_models: Vec<String>,

    /// Opt-in debug feature switches, e.g. `log_polls` to log every raw
    /// poll payload.
    #[serde(default)]
    pub debug: Vec<String>,
}

fn default_api_endpoint() -> String {
    "https://cloud.example-vacuums.com".to_string()
}

fn default_status_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(59)
}

fn default_backoff_min() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(300)
}

fn default_refresh_window() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("api_endpoint must be an http(s) URL")]
    InvalidEndpoint,
}

impl AccountConfig {
    /// Check invariants the rest of the crate relies on.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.client_id.is_empty() {
            return Err(ConfigError::Missing("client_id"));
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::Missing("client_secret"));
        }
        if self.token.is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        if self.refresh_token.is_empty() {
            return Err(ConfigError::Missing("refresh_token"));
        }
        if !self.api_endpoint.starts_with("http://") && !self.api_endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidEndpoint);
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("status_interval"));
        }
        if self.backoff_min.is_zero() {
            return Err(ConfigError::ZeroDuration("backoff_min"));
        }
        Ok(self)
    }

    pub fn debug_enabled(&self, feature: &str) -> bool {
        self.debug.iter().any(|f| f == feature)
    }
}

#[cfg(test)]
impl AccountConfig {
    /// A small, fast configuration for unit tests.
    pub fn for_tests() -> Self {
        Self {
            api_endpoint: "http://localhost".to_string(),
            client_id: "test-client".to_string(),
            client_secret: "test-secret".to_string(),
            token: "seed-access-token".to_string(),
            refresh_token: "seed-refresh-token".to_string(),
            status_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            refresh_window: Duration::from_secs(3600),
            supported_models: Vec::new(),
            debug: Vec::new(),
        }
    }
}
