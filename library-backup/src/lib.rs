//! SharePoint Library Backup
//!
//! Date-stamped snapshots of SharePoint document libraries into local,
//! S3 or Azure Blob storage, with archival of items deleted since the
//! previous run.

pub mod config;
pub mod executor;
pub mod remote;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
