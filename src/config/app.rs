//! Main application configuration
//!
//! Configuration loads from environment variables with fallback to defaults;
//! the CLI can override individual values on top.

use crate::matchmaker::MatchmakerSettings;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub node: NodeSettings,
    pub matchmaking: MatchmakingSettings,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Service name for logging
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
}

/// Settings describing how this node advertises itself to the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Address external proxies should route to
    pub address: String,
    /// Port external proxies should route to
    pub port: u16,
}

/// Matchmaking-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchmakingSettings {
    /// Timeout for every IPC request in milliseconds
    pub remote_room_timeout_ms: u64,
    /// Maximum seat-reservation attempts per join
    pub max_join_attempts: u32,
    /// Concurrency gate stagger step in milliseconds
    pub gate_step_ms: u64,
    /// Backoff between seat-reservation retries in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            node: NodeSettings::default(),
            matchmaking: MatchmakingSettings::default(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "arena-room".to_string(),
            log_level: "info".to_string(),
            shutdown_timeout_seconds: 30,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 2567,
        }
    }
}

impl Default for MatchmakingSettings {
    fn default() -> Self {
        Self {
            remote_room_timeout_ms: 2000,
            max_join_attempts: 5,
            gate_step_ms: 100,
            retry_backoff_ms: 25,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to
    /// defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(name) = env::var("SERVICE_NAME") {
            config.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.service.log_level = log_level;
        }
        if let Ok(timeout) = env::var("SHUTDOWN_TIMEOUT_SECONDS") {
            config.service.shutdown_timeout_seconds = timeout
                .parse()
                .map_err(|_| anyhow!("Invalid SHUTDOWN_TIMEOUT_SECONDS value: {}", timeout))?;
        }

        if let Ok(address) = env::var("NODE_ADDRESS") {
            config.node.address = address;
        }
        if let Ok(port) = env::var("NODE_PORT") {
            config.node.port = port
                .parse()
                .map_err(|_| anyhow!("Invalid NODE_PORT value: {}", port))?;
        }

        if let Ok(timeout) = env::var("REMOTE_ROOM_TIMEOUT_MS") {
            config.matchmaking.remote_room_timeout_ms = timeout
                .parse()
                .map_err(|_| anyhow!("Invalid REMOTE_ROOM_TIMEOUT_MS value: {}", timeout))?;
        }
        if let Ok(attempts) = env::var("MAX_JOIN_ATTEMPTS") {
            config.matchmaking.max_join_attempts = attempts
                .parse()
                .map_err(|_| anyhow!("Invalid MAX_JOIN_ATTEMPTS value: {}", attempts))?;
        }
        if let Ok(step) = env::var("GATE_STEP_MS") {
            config.matchmaking.gate_step_ms = step
                .parse()
                .map_err(|_| anyhow!("Invalid GATE_STEP_MS value: {}", step))?;
        }
        if let Ok(backoff) = env::var("RETRY_BACKOFF_MS") {
            config.matchmaking.retry_backoff_ms = backoff
                .parse()
                .map_err(|_| anyhow!("Invalid RETRY_BACKOFF_MS value: {}", backoff))?;
        }

        validate_config(&config)?;
        Ok(config)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Convert the matchmaking section into runtime settings.
    pub fn matchmaker_settings(&self) -> MatchmakerSettings {
        MatchmakerSettings {
            remote_room_timeout: Duration::from_millis(self.matchmaking.remote_room_timeout_ms),
            max_join_attempts: self.matchmaking.max_join_attempts,
            gate_step: Duration::from_millis(self.matchmaking.gate_step_ms),
            retry_backoff: Duration::from_millis(self.matchmaking.retry_backoff_ms),
        }
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }
    if config.node.address.is_empty() {
        return Err(anyhow!("Node address cannot be empty"));
    }
    if config.node.port == 0 {
        return Err(anyhow!("Node port cannot be 0"));
    }
    if config.matchmaking.remote_room_timeout_ms == 0 {
        return Err(anyhow!("Remote room timeout must be greater than 0"));
    }
    if config.matchmaking.max_join_attempts == 0 {
        return Err(anyhow!("Max join attempts must be greater than 0"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.matchmaking.remote_room_timeout_ms, 2000);
        assert_eq!(config.matchmaking.max_join_attempts, 5);
        assert_eq!(config.node.port, 2567);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.service.log_level = "loud".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.matchmaking.max_join_attempts = 0;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.node.port = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_matchmaker_settings_conversion() {
        let config = AppConfig::default();
        let settings = config.matchmaker_settings();
        assert_eq!(settings.remote_room_timeout, Duration::from_millis(2000));
        assert_eq!(settings.gate_step, Duration::from_millis(100));
        assert_eq!(settings.max_join_attempts, 5);
    }
}
