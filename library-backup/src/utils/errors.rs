//! Custom error types for the library backup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Remote API error: {0}")]
    Remote(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<toml::de::Error> for BackupError {
    fn from(err: toml::de::Error) -> Self {
        BackupError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
