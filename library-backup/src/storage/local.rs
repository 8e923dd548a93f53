//! Local filesystem backend.

use super::{CopyOutcome, CHUNK_SIZE};
use crate::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Snapshots under `{root}/snapshots/{date}`, deletions under `{root}/deleted/{date}`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_base(&self, date_key: &str) -> String {
        self.root.join("snapshots").join(date_key).to_string_lossy().into_owned()
    }

    pub fn deleted_base(&self, date_key: &str) -> String {
        self.root.join("deleted").join(date_key).to_string_lossy().into_owned()
    }

    pub async fn ensure_directory(&self, base: &str, relative_path: Option<&str>) -> Result<()> {
        let dir = match relative_path {
            Some(rel) if !rel.is_empty() => resolve(base, rel),
            _ => PathBuf::from(base),
        };
        fs::create_dir_all(&dir).await?;
        Ok(())
    }

    pub async fn write<R>(&self, base: &str, relative_path: &str, mut content: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let target = resolve(base, relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&target).await?;
        let written = copy_chunked(&mut content, &mut file).await?;
        debug!("Wrote {} bytes to {}", written, target.display());
        Ok(())
    }

    pub async fn copy(&self, source_base: &str, relative_path: &str, destination_base: &str) -> CopyOutcome {
        let source = resolve(source_base, relative_path);
        let destination = resolve(destination_base, relative_path);

        let mut reader = match fs::File::open(&source).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return CopyOutcome::NotFound,
            Err(e) => return CopyOutcome::Failed(format!("open {}: {}", source.display(), e)),
        };

        if let Some(parent) = destination.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return CopyOutcome::Failed(format!("create {}: {}", parent.display(), e));
            }
        }

        let mut writer = match fs::File::create(&destination).await {
            Ok(file) => file,
            Err(e) => return CopyOutcome::Failed(format!("create {}: {}", destination.display(), e)),
        };

        match copy_chunked(&mut reader, &mut writer).await {
            Ok(_) => CopyOutcome::Copied,
            Err(e) => CopyOutcome::Failed(format!("copy to {}: {}", destination.display(), e)),
        }
    }
}

/// `base` joined with a forward-slash relative path
fn resolve(base: &str, relative_path: &str) -> PathBuf {
    let mut path = PathBuf::from(base);
    path.extend(relative_path.split(['/', '\\']).filter(|s| !s.is_empty()));
    path
}

/// Copy in fixed `CHUNK_SIZE` reads so memory use is independent of file size
async fn copy_chunked<R>(reader: &mut R, file: &mut fs::File) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(total)
}
