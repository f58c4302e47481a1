// Signaling configuration
// Logging defaults differ between debug and release builds

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::peer::types::ServerConfig;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "info,webrtc=warn";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Bounded retry with exponential backoff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor) as u64)
    }
}

/// Whether a viewer publishes its own camera/microphone.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ViewerMode {
    /// One-way broadcast: the viewer only receives.
    #[default]
    Broadcast,
    /// Two-way call: the viewer publishes local media too.
    TwoWay,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub connect_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub publish_retry: RetryPolicy,
    pub recording_url_ttl_secs: u64,
    pub viewer_mode: ViewerMode,
    pub log_filter: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            connect_timeout_ms: 15_000,
            grace_period_ms: 10_000,
            publish_retry: RetryPolicy::default(),
            recording_url_ttl_secs: 3600,
            viewer_mode: ViewerMode::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Two public STUN servers for redundancy.
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
}

impl SignalingConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn recording_url_ttl(&self) -> Duration {
        Duration::from_secs(self.recording_url_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(Error::Config("at least one ICE server is required".into()));
        }
        for server in &self.ice_servers {
            validate_server(server)?;
        }
        if self.connect_timeout_ms == 0 || self.grace_period_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        if self.publish_retry.max_attempts == 0 {
            return Err(Error::Config("publish_retry.max_attempts must be at least 1".into()));
        }
        if self.recording_url_ttl_secs == 0 {
            return Err(Error::Config("recording_url_ttl_secs must be non-zero".into()));
        }
        Ok(())
    }
}

pub fn validate_server(server: &ServerConfig) -> Result<()> {
    if server.url.is_empty() {
        return Err(Error::Config(format!("ICE server {} has an empty URL", server.id)));
    }
    if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
        return Err(Error::Config(format!(
            "TURN server {} requires username and credential",
            server.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_redundant() {
        let config = SignalingConfig::default();
        config.validate().unwrap();
        assert!(config.ice_servers.len() >= 2);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.recording_url_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = SignalingConfig::from_json(
            r#"{"connect_timeout_ms": 5000, "viewer_mode": "two_way"}"#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.viewer_mode, ViewerMode::TwoWay);
        assert_eq!(config.ice_servers, default_ice_servers());
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let raw = r#"{"ice_servers": [{"id": "t", "type": "turn", "url": "turn.example.org:3478"}]}"#;
        let err = SignalingConfig::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("requires username and credential"));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1000));
    }
}
