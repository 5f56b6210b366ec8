//! Agent configuration
//!
//! Handles:
//! - Collector address and request timeout
//! - Poll/report cadence, worker count and queue sizing
//! - Signing key and collector public key
//!
//! Read from a TOML file in the OS config directory (or `VIGIL_AGENT_CONFIG`),
//! then overridden by environment variables.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vigil_protocol::crypto::{self, KeyError};
use vigil_protocol::EnvelopeKeys;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Collector `host:port` or base URL.
    pub address: String,
    pub log_level: String,
    pub poll_interval_secs: u64,
    pub report_interval_secs: u64,
    /// Number of delivery workers, i.e. concurrent outbound requests.
    pub rate_limit: usize,
    pub queue_capacity: usize,
    pub drain_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub hash_key: Option<String>,
    /// PEM public key of the collector.
    pub crypto_key: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            log_level: "info".to_string(),
            poll_interval_secs: 2,
            report_interval_secs: 10,
            rate_limit: 3,
            queue_capacity: 30,
            drain_timeout_secs: 10,
            request_timeout_secs: 5,
            hash_key: None,
            crypto_key: None,
        }
    }
}

impl AgentConfig {
    /// Load config from `VIGIL_AGENT_CONFIG` or the OS-specific location,
    /// falling back to defaults, then apply environment overrides.
    pub async fn load() -> Result<Self> {
        let path = match std::env::var_os("VIGIL_AGENT_CONFIG") {
            Some(p) => PathBuf::from(p),
            None => Self::config_file_path()?,
        };
        let mut config = Self::from_file(&path).await?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("vigil-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Overrides from `ADDRESS`, `POLL_INTERVAL`, `REPORT_INTERVAL`,
    /// `RATE_LIMIT`, `KEY`, `CRYPTO_KEY`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ADDRESS") {
            self.address = v;
        }
        if let Some(v) = var("POLL_INTERVAL") {
            self.poll_interval_secs = parse_number("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = var("REPORT_INTERVAL") {
            self.report_interval_secs = parse_number("REPORT_INTERVAL", &v)?;
        }
        if let Some(v) = var("RATE_LIMIT") {
            self.rate_limit = parse_number("RATE_LIMIT", &v)?;
        }
        if let Some(v) = var("KEY") {
            self.hash_key = Some(v);
        }
        if let Some(v) = var("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.poll_interval_secs > 0, "poll interval must be at least 1s");
        ensure!(self.report_interval_secs > 0, "report interval must be at least 1s");
        ensure!(self.rate_limit >= 1, "rate limit must allow at least one worker");
        ensure!(self.queue_capacity >= 1, "queue capacity must be at least 1");
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Sender-side key material: signing key and public key.
    pub fn envelope_keys(&self) -> Result<EnvelopeKeys, KeyError> {
        let public_key = match self.crypto_key.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => Some(crypto::load_public_key(path)?),
            _ => None,
        };
        Ok(EnvelopeKeys {
            signing_key: self.hash_key.as_ref().filter(|k| !k.is_empty()).map(|k| k.as_bytes().to_vec()),
            public_key,
            private_key: None,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{key} must be a whole number, got {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.report_interval(), Duration::from_secs(10));
        assert_eq!(config.rate_limit, 3);
        assert_eq!(config.queue_capacity, 30);
        assert_eq!(config.drain_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AgentConfig::default();
        config
            .apply_env(env(&[
                ("ADDRESS", "collector:9000"),
                ("POLL_INTERVAL", "1"),
                ("REPORT_INTERVAL", " 5 "),
                ("RATE_LIMIT", "8"),
                ("KEY", "secret"),
                ("CRYPTO_KEY", ""),
            ]))
            .unwrap();
        assert_eq!(config.address, "collector:9000");
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.report_interval_secs, 5);
        assert_eq!(config.rate_limit, 8);

        let keys = config.envelope_keys().unwrap();
        assert_eq!(keys.signing_key.as_deref(), Some(b"secret".as_slice()));
        assert!(keys.public_key.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = AgentConfig::default();
        assert!(config.apply_env(env(&[("RATE_LIMIT", "-1")])).is_err());
        assert!(config.apply_env(env(&[("POLL_INTERVAL", "2s")])).is_err());

        config.rate_limit = 0;
        assert!(config.validate().is_err());
        let config = AgentConfig { report_interval_secs: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_partial_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "address = \"http://10.0.0.5:8080\"\nrate_limit = 5\n").unwrap();

        let config = AgentConfig::from_file(&path).await.unwrap();
        assert_eq!(config.address, "http://10.0.0.5:8080");
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.poll_interval_secs, 2);

        let missing = AgentConfig::from_file(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(missing, AgentConfig::default());
    }

    #[test]
    fn test_missing_public_key_file() {
        let config = AgentConfig { crypto_key: Some(PathBuf::from("/nonexistent/key.pem")), ..Default::default() };
        assert!(matches!(config.envelope_keys(), Err(KeyError::Read { .. })));
    }
}
