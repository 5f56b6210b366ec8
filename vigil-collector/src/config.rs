//! Collector configuration: YAML file, then environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use vigil_protocol::crypto::{self, KeyError};
use vigil_protocol::EnvelopeKeys;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CollectorConfig {
    /// `host:port` to listen on.
    pub address: String,
    pub log_level: String,
    /// Seconds between backup snapshots; 0 snapshots after every write.
    pub store_interval_secs: u64,
    /// Backup file; empty disables backups.
    pub file_storage_path: PathBuf,
    pub restore: bool,
    /// Postgres DSN; absent selects the in-memory store.
    pub database_dsn: Option<String>,
    /// HMAC key for request signatures.
    pub hash_key: Option<String>,
    /// PEM private key for encrypted bodies.
    pub crypto_key: Option<PathBuf>,
    /// File the settings were read from; `None` when defaults were used.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".into(),
            log_level: "info".into(),
            store_interval_secs: 300,
            file_storage_path: PathBuf::from("./backup"),
            restore: true,
            database_dsn: None,
            hash_key: None,
            crypto_key: None,
            loaded_from: None,
        }
    }
}

impl CollectorConfig {
    /// Reads `VIGIL_COLLECTOR_CONFIG` (default `collector.yaml`) if present, then
    /// applies environment overrides.
    pub async fn load() -> Result<Self> {
        let path = std::env::var("VIGIL_COLLECTOR_CONFIG").unwrap_or_else(|_| "collector.yaml".into());
        let mut cfg = Self::from_file(Path::new(&path)).await?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Runs before logging is set up, so it reports through `loaded_from`
    /// instead of logging.
    async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let mut cfg: Self = if txt.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&txt).with_context(|| format!("invalid config in {}", path.display()))?
        };
        cfg.loaded_from = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Overrides from `ADDRESS`, `LOG_LEVEL`, `STORE_INTERVAL`, `FILE_STORAGE_PATH`,
    /// `RESTORE`, `DATABASE_DSN`, `KEY`, `CRYPTO_KEY`. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("ADDRESS") {
            self.address = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("STORE_INTERVAL") {
            self.store_interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("STORE_INTERVAL must be whole seconds, got {v:?}"))?;
        }
        if let Some(v) = var("FILE_STORAGE_PATH") {
            self.file_storage_path = PathBuf::from(v);
        }
        if let Some(v) = var("RESTORE") {
            self.restore = parse_bool(&v).with_context(|| format!("RESTORE must be a boolean, got {v:?}"))?;
        }
        if let Some(v) = var("DATABASE_DSN") {
            self.database_dsn = Some(v);
        }
        if let Some(v) = var("KEY") {
            self.hash_key = Some(v);
        }
        if let Some(v) = var("CRYPTO_KEY") {
            self.crypto_key = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn store_interval(&self) -> Duration {
        Duration::from_secs(self.store_interval_secs)
    }

    pub fn backup_enabled(&self) -> bool {
        !self.file_storage_path.as_os_str().is_empty()
    }

    /// Receiver-side key material: signing key and private key.
    pub fn envelope_keys(&self) -> Result<EnvelopeKeys, KeyError> {
        let private_key = match self.crypto_key.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => Some(crypto::load_private_key(path)?),
            _ => None,
        };
        Ok(EnvelopeKeys {
            signing_key: self.hash_key.as_ref().filter(|k| !k.is_empty()).map(|k| k.as_bytes().to_vec()),
            public_key: None,
            private_key,
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
