//! Manifest types and the local run-state store.
//!
//! A manifest maps every backed-up item id to its last known path. The state
//! directory keeps the manifest of the last completed run
//! (`latest_manifest.json`) and the base its files were written under
//! (`latest_snapshot.txt`). Diffing the previous manifest against the current
//! one yields the items deleted since that run.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "latest_manifest.json";
pub const SNAPSHOT_FILE: &str = "latest_snapshot.txt";

/// Item id -> entry, serialized as a plain JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub files: HashMap<String, ManifestEntry>,
}

/// Metadata for a single backed-up file.
///
/// Only `path` is needed to archive a deleted item, so the other fields
/// tolerate being absent in older or hand-edited manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// `{site}/{drive}/...` with forward slashes
    pub path: String,
    #[serde(default)]
    pub drive_id: String,
    #[serde(default)]
    pub site_id: String,
    #[serde(default)]
    pub name: String,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, entry: ManifestEntry) {
        self.files.insert(id.into(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&ManifestEntry> {
        self.files.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.files.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Parse a persisted manifest entry by entry. Entries that are not
    /// objects or have no usable `path` are skipped with a warning; only a
    /// document that is not a JSON object at all is an error.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut manifest = Manifest::new();

        for (id, value) in raw {
            match serde_json::from_value::<ManifestEntry>(value) {
                Ok(entry) if !entry.path.trim().is_empty() => manifest.insert(id, entry),
                Ok(_) => warn!("Skipping manifest entry {}: empty path", id),
                Err(e) => warn!("Skipping manifest entry {}: {}", id, e),
            }
        }

        Ok(manifest)
    }

    /// Entries of `self` whose ids are absent from `current`, sorted by id
    pub fn deleted_since<'a>(&'a self, current: &Manifest) -> Vec<(&'a str, &'a ManifestEntry)> {
        let mut deleted: Vec<(&str, &ManifestEntry)> = self
            .files
            .iter()
            .filter(|(id, _)| !current.contains(id))
            .map(|(id, entry)| (id.as_str(), entry))
            .collect();
        deleted.sort_by(|a, b| a.0.cmp(b.0));
        deleted
    }
}

/// State left behind by the last completed run
#[derive(Debug, Clone, Default)]
pub struct RunState {
    pub manifest: Manifest,

    /// Snapshot base of the previous run; `None` on the first run
    pub snapshot_base: Option<String>,
}

/// Reads and replaces run state under a local directory.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    state_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: state_dir.as_ref().to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.state_dir.join(MANIFEST_FILE)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    /// Load the previous run's state. Never fails: a missing or corrupt
    /// manifest loads as empty, so every item is treated as new.
    pub fn load_previous(&self) -> RunState {
        let manifest = match fs::read_to_string(self.manifest_path()) {
            Ok(text) => match Manifest::from_json(&text) {
                Ok(manifest) => {
                    info!("Loaded previous manifest: {} items", manifest.len());
                    manifest
                }
                Err(e) => {
                    warn!("Ignoring unreadable manifest {}: {}", self.manifest_path().display(), e);
                    Manifest::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No previous manifest, deletion detection disabled for this run");
                Manifest::new()
            }
            Err(e) => {
                warn!("Cannot read manifest {}: {}", self.manifest_path().display(), e);
                Manifest::new()
            }
        };

        let snapshot_base = match fs::read_to_string(self.snapshot_path()) {
            Ok(text) => Some(text.trim().to_string()).filter(|s| !s.is_empty()),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot read {}: {}", self.snapshot_path().display(), e);
                }
                None
            }
        };

        RunState {
            manifest,
            snapshot_base,
        }
    }

    /// Replace the persisted state with `manifest` and `snapshot_base`.
    ///
    /// Both files are fully written to temporaries before either is renamed
    /// into place.
    pub fn persist(&self, manifest: &Manifest, snapshot_base: &str) -> Result<()> {
        fs::create_dir_all(&self.state_dir)?;

        let manifest_tmp = self.state_dir.join(format!(".{}.tmp", MANIFEST_FILE));
        let snapshot_tmp = self.state_dir.join(format!(".{}.tmp", SNAPSHOT_FILE));

        fs::write(&manifest_tmp, serde_json::to_string_pretty(manifest)?)?;
        fs::write(&snapshot_tmp, snapshot_base)?;

        fs::rename(&manifest_tmp, self.manifest_path())?;
        fs::rename(&snapshot_tmp, self.snapshot_path())?;

        debug!(
            "Persisted manifest ({} items) and snapshot base {} to {}",
            manifest.len(),
            snapshot_base,
            self.state_dir.display()
        );
        Ok(())
    }
}
