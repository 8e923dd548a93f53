//! Remote document-library model and the capabilities the backup consumes.
//!
//! The executor only talks to the remote side through [`TokenProvider`] and
//! [`RemoteSource`]; the Graph implementations live in [`auth`] and [`graph`].

pub mod auth;
pub mod graph;
pub mod walker;

use crate::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncRead;

/// Readable byte stream of one file's content.
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// A SharePoint site (one backup root).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Site {
    /// Name used as the first path segment of every backed-up file
    pub fn label(&self) -> &str {
        non_empty(&self.name)
            .or_else(|| non_empty(&self.display_name))
            .unwrap_or(self.id.as_str())
    }
}

/// A document library (drive) inside a site.
#[derive(Debug, Clone, Deserialize)]
pub struct Drive {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Drive {
    pub fn label(&self) -> &str {
        non_empty(&self.name).unwrap_or(self.id.as_str())
    }
}

/// One resolved collection to back up: a drive together with its site.
#[derive(Debug, Clone)]
pub struct RemoteRoot {
    pub site_id: String,
    pub site_name: String,
    pub drive_id: String,
    pub drive_name: String,
}

impl RemoteRoot {
    pub fn new(site: &Site, drive: &Drive) -> Self {
        Self {
            site_id: site.id.clone(),
            site_name: site.label().to_string(),
            drive_id: drive.id.clone(),
            drive_name: drive.label().to_string(),
        }
    }

    /// Path prefix of every item in this collection: `{site}/{drive}`
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.site_name, self.drive_name)
    }
}

/// Folder facet of a drive item.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

/// A node in the remote tree; folders carry a [`FolderFacet`].
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
}

impl RemoteItem {
    pub fn file(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: None,
        }
    }

    pub fn folder(id: impl Into<String>, name: impl Into<String>, child_count: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: Some(FolderFacet { child_count }),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChildrenPage {
    #[serde(default)]
    pub value: Vec<RemoteItem>,

    /// Opaque continuation; `None` once the listing is exhausted
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Produces a bearer token for the remote API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn acquire_token(&self) -> Result<String>;
}

/// Listing and download capabilities of the remote document store.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Resolve configured site identifiers; an empty list resolves the default site.
    async fn resolve_sites(&self, token: &str, sites: &[String]) -> Result<Vec<Site>>;

    /// Document libraries of a site
    async fn list_drives(&self, token: &str, site_id: &str) -> Result<Vec<Drive>>;

    /// Item id of a drive's root folder
    async fn drive_root_id(&self, token: &str, drive_id: &str) -> Result<String>;

    /// One page of a folder's children. `page` is the continuation returned
    /// by the previous call, or `None` for the first page.
    async fn list_children(
        &self,
        token: &str,
        drive_id: &str,
        item_id: &str,
        page: Option<&str>,
    ) -> Result<ChildrenPage>;

    /// Stream a file's content
    async fn download(&self, token: &str, drive_id: &str, item_id: &str) -> Result<ContentReader>;
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
