//! Configuration management for the library backup.
//!
//! Loads configuration from a TOML credentials file, falling back to
//! environment variables when no file is present.

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Credentials file written by `library-backup configure`.
pub const INTERACTIVE_CONFIG_PATH: &str = "credentials/credentials.toml";

/// Credentials file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "credentials.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Azure AD tenant
    pub tenant_id: String,

    /// App registration client id
    pub client_id: String,

    /// App registration client secret
    pub client_secret: String,

    /// Storage medium the snapshot is written to
    #[serde(default)]
    pub backup_backend: BackendKind,

    /// Root directory for the local backend
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// One snapshot per calendar day (true) or one per run (false)
    #[serde(default = "default_snapshot_daily")]
    pub snapshot_daily: bool,

    /// Site ids or resource paths; empty means the tenant root site
    #[serde(default)]
    pub sites: Vec<String>,

    /// Directory holding the manifest of the previous run
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub s3: S3Config,

    #[serde(default)]
    pub azure_blob: AzureBlobConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    S3,
    AzureBlob,
}

impl std::str::FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            "azure_blob" => Ok(BackendKind::AzureBlob),
            other => Err(BackendError(other.to_string())),
        }
    }
}

/// Unknown backend name.
#[derive(Debug)]
pub struct BackendError(pub String);

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown backend '{}' (expected local, s3 or azure_blob)", self.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: Option<String>,
    pub region_name: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,

    /// Custom endpoint for S3-compatible services (MinIO, LocalStack)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureBlobConfig {
    pub connection_string: Option<String>,
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_snapshot_daily() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backup_backend = match var("BACKUP_BACKEND") {
            Some(raw) => raw
                .parse()
                .map_err(|e: BackendError| BackupError::Config(e.to_string()))?,
            None => BackendKind::default(),
        };

        let config = Config {
            tenant_id: var("TENANT_ID").unwrap_or_default(),
            client_id: var("CLIENT_ID").unwrap_or_default(),
            client_secret: var("CLIENT_SECRET").unwrap_or_default(),
            backup_backend,
            backup_dir: var("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_backup_dir),
            snapshot_daily: var("SNAPSHOT_DAILY")
                .map(|v| parse_flag(&v))
                .unwrap_or_else(default_snapshot_daily),
            sites: var("SITES").map(|v| split_list(&v)).unwrap_or_default(),
            state_dir: var("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_state_dir),
            s3: S3Config {
                bucket_name: var("S3_BUCKET_NAME"),
                region_name: var("S3_REGION_NAME"),
                aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
                aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
                endpoint_url: var("S3_ENDPOINT_URL"),
            },
            azure_blob: AzureBlobConfig {
                connection_string: var("AZURE_CONNECTION_STRING"),
                container_name: var("AZURE_CONTAINER_NAME"),
            },
            log: LogConfig {
                level: var("LOG_LEVEL").unwrap_or_else(default_log_level),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration the way the binary does: explicit path, then
    /// the interactive credentials file, then `credentials.toml`, then env.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for candidate in [INTERACTIVE_CONFIG_PATH, DEFAULT_CONFIG_PATH] {
            let path = Path::new(candidate);
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::debug!("No credentials file found, reading environment");
        Self::from_env()
    }

    /// Serialize to TOML (used by `configure`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BackupError::Config(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("tenant_id", &self.tenant_id),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if !missing.is_empty() {
            return Err(BackupError::Config(format!(
                "missing {} (no credentials file found and environment incomplete; run `library-backup configure`)",
                missing.join(", ")
            )));
        }

        Ok(())
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "n"
    )
}

/// Split a comma-separated list, dropping blank entries
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
