//! Storage backends for snapshots and archived deletions.
//!
//! The three media share one contract, dispatched through [`StorageBackend`]:
//! - `write` consumes the reader in bounded chunks and overwrites the target;
//! - `copy` of a missing source is [`CopyOutcome::NotFound`], never an error;
//! - `ensure_directory` only does work where directories are real.

pub mod azure_blob;
pub mod local;
pub mod s3;

use crate::config::{BackendKind, Config};
use crate::remote::ContentReader;
use crate::utils::{BackupError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use azure_blob::AzureBlobStorage;
pub use local::LocalStorage;
pub use s3::S3Storage;

/// Read size used when streaming content through the local filesystem.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Result of archiving one object from one base into another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// Source object absent; nothing to archive
    NotFound,
    Failed(String),
}

/// Storage medium selected at startup
pub enum StorageBackend {
    Local(LocalStorage),
    S3(S3Storage),
    AzureBlob(AzureBlobStorage),
}

impl StorageBackend {
    /// Build the backend named by the configuration
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.backup_backend {
            BackendKind::Local => Ok(Self::Local(LocalStorage::new(&config.backup_dir))),
            BackendKind::S3 => Ok(Self::S3(S3Storage::from_config(&config.s3).await?)),
            BackendKind::AzureBlob => {
                Ok(Self::AzureBlob(AzureBlobStorage::from_config(&config.azure_blob).await?))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
            Self::AzureBlob(_) => "azure_blob",
        }
    }

    /// Base under which the snapshot for `date_key` is written
    pub fn snapshot_base(&self, date_key: &str) -> String {
        match self {
            Self::Local(s) => s.snapshot_base(date_key),
            Self::S3(_) | Self::AzureBlob(_) => format!("snapshots/{}", date_key),
        }
    }

    /// Base under which deleted items detected on `date_key` are archived
    pub fn deleted_base(&self, date_key: &str) -> String {
        match self {
            Self::Local(s) => s.deleted_base(date_key),
            Self::S3(_) | Self::AzureBlob(_) => format!("deleted/{}", date_key),
        }
    }

    /// Stream `content` to `base/relative_path`, replacing any existing object
    pub async fn write(&self, base: &str, relative_path: &str, content: ContentReader) -> Result<()> {
        match self {
            Self::Local(s) => s.write(base, relative_path, content).await,
            Self::S3(s) => s.write(base, relative_path, content).await,
            Self::AzureBlob(s) => s.write(base, relative_path, content).await,
        }
    }

    /// Copy `source_base/relative_path` to `destination_base/relative_path`
    pub async fn copy(&self, source_base: &str, relative_path: &str, destination_base: &str) -> CopyOutcome {
        match self {
            Self::Local(s) => s.copy(source_base, relative_path, destination_base).await,
            Self::S3(s) => s.copy(source_base, relative_path, destination_base).await,
            Self::AzureBlob(s) => s.copy(source_base, relative_path, destination_base).await,
        }
    }

    /// Materialize an (empty) directory; flat namespaces need nothing
    pub async fn ensure_directory(&self, base: &str, relative_path: Option<&str>) -> Result<()> {
        match self {
            Self::Local(s) => s.ensure_directory(base, relative_path).await,
            Self::S3(_) | Self::AzureBlob(_) => Ok(()),
        }
    }
}

/// Object key for `base/relative_path` with forward slashes only
pub fn object_key(base: &str, relative_path: &str) -> String {
    let base = base.replace('\\', "/");
    let relative = relative_path.replace('\\', "/");
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');

    if base.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
/// Returns the number of bytes read; fewer than `buf.len()` means EOF.
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub(crate) fn storage_error(context: &str, err: impl std::fmt::Display) -> BackupError {
    BackupError::Storage(format!("{}: {}", context, err))
}
