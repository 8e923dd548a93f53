//! Backup run executor - drives one complete backup.
//!
//! A run authenticates, resolves the sites to back up, walks every document
//! library of every site and streams each file into today's snapshot base.
//! Files that were in the previous manifest but are no longer reachable are
//! archived from the previous snapshot into today's deleted base. Run state
//! is persisted only once all of that has finished.

pub mod manifest;

use crate::remote::walker::{TreeWalker, WalkEntry};
use crate::remote::{ContentReader, RemoteRoot, RemoteSource, TokenProvider};
use crate::storage::{CopyOutcome, StorageBackend};
use crate::transfer::{format_bytes, format_duration, ProgressReader};
use crate::Result;
use chrono::{DateTime, Utc};
use manifest::{Manifest, ManifestEntry, ManifestStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Date key and bases for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub date_key: String,
    pub snapshot_base: String,
    pub deleted_base: String,
}

impl RunContext {
    pub fn new(backend: &StorageBackend, date_key: impl Into<String>) -> Self {
        let date_key = date_key.into();
        Self {
            snapshot_base: backend.snapshot_base(&date_key),
            deleted_base: backend.deleted_base(&date_key),
            date_key,
        }
    }

    /// `YYYY-MM-DD` for daily snapshots, otherwise a per-run UTC timestamp
    pub fn date_key(now: DateTime<Utc>, daily: bool) -> String {
        if daily {
            now.format("%Y-%m-%d").to_string()
        } else {
            now.format("%Y-%m-%dT%H-%M-%SZ").to_string()
        }
    }
}

/// A deleted item whose archival copy failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFailure {
    pub id: String,
    pub path: String,
    pub reason: String,
}

/// Backup execution result
#[derive(Debug, Default)]
pub struct BackupResult {
    pub snapshot_base: String,
    pub files_written: usize,
    pub bytes_written: u64,
    pub directories: usize,
    /// Ids present in the previous manifest but not in this run's
    pub deleted_ids: Vec<String>,
    pub archived: usize,
    /// Deleted items whose previous snapshot copy no longer existed
    pub missing_sources: usize,
    pub archive_failures: Vec<ArchiveFailure>,
    pub duration_secs: u64,
}

impl BackupResult {
    pub fn log_summary(&self) {
        info!(
            "Backup complete: {} files ({}), {} folders, {} deleted ({} archived, {} missing, {} failed) in {}",
            self.files_written,
            format_bytes(self.bytes_written),
            self.directories,
            self.deleted_ids.len(),
            self.archived,
            self.missing_sources,
            self.archive_failures.len(),
            format_duration(self.duration_secs)
        );
    }
}

/// Main backup executor
pub struct BackupExecutor<'a, T: TokenProvider + ?Sized, S: RemoteSource + ?Sized> {
    auth: &'a T,
    source: &'a S,
    backend: &'a StorageBackend,
    store: ManifestStore,
}

impl<'a, T: TokenProvider + ?Sized, S: RemoteSource + ?Sized> BackupExecutor<'a, T, S> {
    pub fn new(auth: &'a T, source: &'a S, backend: &'a StorageBackend, store: ManifestStore) -> Self {
        Self {
            auth,
            source,
            backend,
            store,
        }
    }

    /// Run one backup dated now
    pub async fn run(&self, sites: &[String], daily: bool) -> Result<BackupResult> {
        let ctx = RunContext::new(self.backend, RunContext::date_key(Utc::now(), daily));
        self.execute(sites, &ctx).await
    }

    /// Execute a backup into the bases of `ctx`.
    ///
    /// Authentication, listing and snapshot write failures abort the run
    /// before any state is persisted. Archive failures during the deletion
    /// sweep are collected in the result instead.
    pub async fn execute(&self, sites: &[String], ctx: &RunContext) -> Result<BackupResult> {
        let start_time = Instant::now();

        info!(
            "Starting backup {} into {} backend at {}",
            ctx.date_key,
            self.backend.kind(),
            ctx.snapshot_base
        );

        let token = self.auth.acquire_token().await?;
        let resolved = self.source.resolve_sites(&token, sites).await?;
        info!("Resolved {} site(s)", resolved.len());

        let previous = self.store.load_previous();

        let mut result = BackupResult {
            snapshot_base: ctx.snapshot_base.clone(),
            ..Default::default()
        };
        let mut current = Manifest::new();

        self.backend.ensure_directory(&ctx.snapshot_base, None).await?;

        for site in &resolved {
            let drives = self.source.list_drives(&token, &site.id).await?;
            debug!("Site {} has {} drive(s)", site.label(), drives.len());

            for drive in &drives {
                let root = RemoteRoot::new(site, drive);
                self.backup_root(&token, &root, ctx, &mut current, &mut result).await?;
            }
        }

        let deleted = previous.manifest.deleted_since(&current);
        result.deleted_ids = deleted.iter().map(|(id, _)| id.to_string()).collect();

        match &previous.snapshot_base {
            Some(previous_base) if !deleted.is_empty() => {
                info!(
                    "{} item(s) deleted since last run, archiving from {}",
                    deleted.len(),
                    previous_base
                );
                for (id, entry) in &deleted {
                    self.archive(id, entry, previous_base, ctx, &mut result).await;
                }
            }
            Some(_) => debug!("No deleted items"),
            None => debug!("No previous snapshot, skipping deletion sweep"),
        }

        self.store.persist(&current, &ctx.snapshot_base)?;

        result.duration_secs = start_time.elapsed().as_secs();
        result.log_summary();
        Ok(result)
    }

    /// Walk one drive into the snapshot, recording written files
    async fn backup_root(
        &self,
        token: &str,
        root: &RemoteRoot,
        ctx: &RunContext,
        current: &mut Manifest,
        result: &mut BackupResult,
    ) -> Result<()> {
        let prefix = root.prefix();
        info!("Backing up {}", prefix);

        let root_id = self.source.drive_root_id(token, &root.drive_id).await?;
        self.backend.ensure_directory(&ctx.snapshot_base, Some(prefix.as_str())).await?;

        let mut walker = TreeWalker::start(self.source, token, &root.drive_id, &root_id, &prefix).await?;

        while let Some(entry) = walker.next().await? {
            match entry {
                WalkEntry::Directory(path) => {
                    self.backend.ensure_directory(&ctx.snapshot_base, Some(path.as_str())).await?;
                    result.directories += 1;
                }
                WalkEntry::File { path, item } => {
                    let content = self.source.download(token, &root.drive_id, &item.id).await?;

                    let label = path.clone();
                    let reader = ProgressReader::new(content).with_callback(Arc::new(move |bytes: u64| {
                        debug!("{}: {}", label, format_bytes(bytes));
                    }));
                    let counter = reader.counter();

                    self.backend
                        .write(&ctx.snapshot_base, &path, Box::new(reader) as ContentReader)
                        .await?;

                    let bytes = counter.load(Ordering::Relaxed);
                    info!("Saved {} ({})", path, format_bytes(bytes));

                    result.files_written += 1;
                    result.bytes_written += bytes;

                    current.insert(
                        item.id,
                        ManifestEntry {
                            path,
                            drive_id: root.drive_id.clone(),
                            site_id: root.site_id.clone(),
                            name: item.name,
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Best-effort copy of one deleted item out of the previous snapshot
    async fn archive(
        &self,
        id: &str,
        entry: &ManifestEntry,
        previous_base: &str,
        ctx: &RunContext,
        result: &mut BackupResult,
    ) {
        match self.backend.copy(previous_base, &entry.path, &ctx.deleted_base).await {
            CopyOutcome::Copied => {
                info!("Archived deleted item {}", entry.path);
                result.archived += 1;
            }
            CopyOutcome::NotFound => {
                debug!("Deleted item {} not in previous snapshot", entry.path);
                result.missing_sources += 1;
            }
            CopyOutcome::Failed(reason) => {
                warn!("Failed to archive deleted item {}: {}", entry.path, reason);
                result.archive_failures.push(ArchiveFailure {
                    id: id.to_string(),
                    path: entry.path.clone(),
                    reason,
                });
            }
        }
    }
}
