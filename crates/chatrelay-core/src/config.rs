//! Relay configuration
//!
//! Read from `~/.chatrelay/config.toml`; every field has a default so a
//! missing file or a partial one is fine. `CHATRELAY_BASE_URL` and
//! `CHATRELAY_TRANSPORT` override the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants;
use crate::error::RelayError;
use crate::paths;
use crate::relay::RelaySettings;
use crate::transport::ReconnectPolicy;

/// Which wire the relay streams over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Sse,
    Socket,
    Post,
}

impl FromStr for TransportKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sse" => Ok(TransportKind::Sse),
            "socket" | "websocket" | "ws" => Ok(TransportKind::Socket),
            "post" => Ok(TransportKind::Post),
            other => Err(RelayError::Config(format!("unknown transport: {other}"))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Sse => "sse",
            TransportKind::Socket => "socket",
            TransportKind::Post => "post",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub base_url: String,
    pub transport: TransportKind,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub interrupt_timeout_secs: u64,
    pub auth_poll_interval_secs: u64,
    /// SQLite file; defaults to `~/.chatrelay/chats.db`
    pub database_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: constants::http::DEFAULT_BASE_URL.to_string(),
            transport: TransportKind::default(),
            reconnect_attempts: constants::transport::MAX_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: constants::transport::RECONNECT_DELAY_UNIT.as_millis() as u64,
            interrupt_timeout_secs: constants::conversation::INTERRUPT_TIMEOUT.as_secs(),
            auth_poll_interval_secs: constants::conversation::AUTH_POLL_INTERVAL.as_secs(),
            database_path: None,
        }
    }
}

impl RelayConfig {
    /// Load from `path` (or the default location), then apply env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(paths::config_file);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            let config = Self::from_toml(&contents)
                .with_context(|| format!("Invalid config file {:?}", path))?;
            info!("Loaded config from {:?}", path);
            config
        } else {
            debug!("No config file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `CHATRELAY_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CHATRELAY_BASE_URL").filter(|v| !v.trim().is_empty()) {
            debug!("Base URL overridden from environment");
            self.base_url = url.trim().to_string();
        }
        if let Some(kind) = lookup("CHATRELAY_TRANSPORT").filter(|v| !v.trim().is_empty()) {
            self.transport = kind.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| RelayError::Config(format!("invalid base_url {}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::Config(format!(
                "base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.interrupt_timeout_secs == 0 {
            return Err(RelayError::Config(
                "interrupt_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            delay_unit: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            interrupt_timeout: Duration::from_secs(self.interrupt_timeout_secs),
            reconnect: self.reconnect_policy(),
            persistence_timeout: constants::conversation::PERSISTENCE_TIMEOUT,
        }
    }

    pub fn auth_poll_interval(&self) -> Duration {
        Duration::from_secs(self.auth_poll_interval_secs.max(1))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(paths::database_file)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.base_url, "http://localhost:3000");
        assert_eq!(config.transport, TransportKind::Sse);
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::default());
        assert_eq!(
            config.relay_settings().interrupt_timeout,
            Duration::from_secs(60)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            base_url = "https://chat.example.com"
            transport = "socket"
            interrupt_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://chat.example.com");
        assert_eq!(config.transport, TransportKind::Socket);
        assert_eq!(config.interrupt_timeout_secs, 30);
        assert_eq!(config.reconnect_attempts, 3);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CHATRELAY_BASE_URL", "https://override.example.com"),
            ("CHATRELAY_TRANSPORT", "POST"),
        ]
        .into_iter()
        .collect();
        let mut config = RelayConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.base_url, "https://override.example.com");
        assert_eq!(config.transport, TransportKind::Post);
    }

    #[test]
    fn test_bad_transport_override() {
        let mut config = RelayConfig::default();
        let result = config.apply_overrides(|name| {
            (name == "CHATRELAY_TRANSPORT").then(|| "carrier-pigeon".to_string())
        });
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = RelayConfig {
            base_url: "ftp://example.com".to_string(),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            interrupt_timeout_secs: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = RelayConfig::load(Some(&temp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.reconnect_attempts, 3);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "transport = 42").unwrap();
        assert!(RelayConfig::load(Some(&path)).is_err());
    }
}
