//! Configuration loading and persistence.
//!
//! Handles reading and writing the gateway client configuration file.
//! The auth token is environment-only and never written to disk.

use anyhow::Result;
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_RECONNECT_INITIAL_DELAY_MS,
    DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_RECONNECT_MULTIPLIER, DEFAULT_REQUEST_TIMEOUT_MS,
};

/// Configuration for the gateway client.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// WebSocket URL of the gateway.
    pub gateway_url: String,
    /// Shared auth token - NOT serialized to disk (env var only).
    /// When empty, the persisted device token is used instead.
    #[serde(skip)]
    pub auth_token: String,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_delay_ms: u64,
    /// Reconnect delay cap in milliseconds. Raised to the initial delay
    /// when configured below it.
    pub reconnect_max_delay_ms: u64,
    /// Multiplier applied to the reconnect delay after each failure.
    /// Values below 2 are raised to 2.
    pub reconnect_multiplier: u64,
    /// Keepalive ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Per-request deadline in milliseconds. 0 disables the deadline.
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:18789".to_string(),
            auth_token: String::new(),
            reconnect_initial_delay_ms: DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            reconnect_multiplier: DEFAULT_RECONNECT_MULTIPLIER,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/openclaw-test`
    /// 2. `OPENCLAW_CONFIG_DIR` env var: explicit override
    /// 3. Default: platform config dir (e.g. `~/.config/openclaw`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                // Unit tests: use repo's tmp/ directory (already gitignored)
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/openclaw-test")
            }

            #[cfg(not(test))]
            {
                use anyhow::Context;

                if let Ok(custom_dir) = std::env::var("OPENCLAW_CONFIG_DIR") {
                    // Explicit override via env var (integration tests, daemons)
                    PathBuf::from(custom_dir)
                } else {
                    // Production: use platform-standard config directory
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("openclaw")
                }
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(gateway_url) = std::env::var("OPENCLAW_GATEWAY_URL") {
            self.gateway_url = gateway_url;
        }

        // Token from env var only; the gateway issues a device token per
        // identity, so most deployments leave this unset
        if let Ok(token) = std::env::var("OPENCLAW_AUTH_TOKEN") {
            self.auth_token = token;
        }

        if let Ok(timeout_ms) = std::env::var("OPENCLAW_REQUEST_TIMEOUT_MS") {
            if let Ok(timeout) = timeout_ms.parse::<u64>() {
                self.request_timeout_ms = timeout;
            }
        }
    }

    /// Persists the current configuration to disk.
    /// Note: the auth token is NOT saved (env var only).
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Keepalive ping interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Per-request deadline, or `None` when disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        if self.request_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.request_timeout_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_url, "ws://127.0.0.1:18789");
        assert_eq!(config.reconnect_initial_delay_ms, 1000);
        assert_eq!(config.reconnect_max_delay_ms, 30_000);
        assert_eq!(config.reconnect_multiplier, 2);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn test_config_serialization_excludes_token() {
        let mut config = Config::default();
        config.auth_token = "secret_token".to_string();
        let json = serde_json::to_string(&config).unwrap();

        // Token should NOT be in the JSON
        assert!(!json.contains("secret_token"));
        assert!(!json.contains("auth_token"));
    }

    #[test]
    fn test_request_timeout_zero_disables() {
        let mut config = Config::default();
        assert!(config.request_timeout().is_some());

        config.request_timeout_ms = 0;
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let mut config = Config::default();
        config.gateway_url = "wss://gateway.example.com".to_string();
        config.reconnect_initial_delay_ms = 250;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.gateway_url, "wss://gateway.example.com");
        assert_eq!(parsed.reconnect_initial_delay_ms, 250);
        // Skipped field deserializes to its Default
        assert!(parsed.auth_token.is_empty());
    }
}
