//! Microsoft Graph client for SharePoint sites, drives and drive items.

use super::{ChildrenPage, ContentReader, Drive, RemoteSource, Site};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::debug;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Deserialize)]
struct ValueList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ItemId {
    id: String,
}

/// [`RemoteSource`] backed by the Graph REST API.
#[derive(Debug, Clone)]
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, GRAPH_BASE_URL)
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// GET returning JSON; non-2xx statuses become [`BackupError::Remote`]
    async fn get_json<T: DeserializeOwned>(&self, url: &str, token: &str) -> Result<T> {
        let resp = self.get(url, token).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn get(&self, url: &str, token: &str) -> Result<reqwest::Response> {
        debug!("GET {}", url);
        let resp = self.http.get(url).bearer_auth(token).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::Remote(format!("GET {} returned {}: {}", url, status, body)));
        }

        Ok(resp)
    }
}

#[async_trait]
impl RemoteSource for GraphClient {
    async fn resolve_sites(&self, token: &str, sites: &[String]) -> Result<Vec<Site>> {
        if sites.is_empty() {
            let site = self.get_json(&self.url("sites/root"), token).await?;
            return Ok(vec![site]);
        }

        let mut resolved = Vec::with_capacity(sites.len());
        for site in sites {
            resolved.push(self.get_json(&self.url(&format!("sites/{}", site)), token).await?);
        }
        Ok(resolved)
    }

    async fn list_drives(&self, token: &str, site_id: &str) -> Result<Vec<Drive>> {
        let list: ValueList<Drive> = self
            .get_json(&self.url(&format!("sites/{}/drives", site_id)), token)
            .await?;
        Ok(list.value)
    }

    async fn drive_root_id(&self, token: &str, drive_id: &str) -> Result<String> {
        let root: ItemId = self
            .get_json(&self.url(&format!("drives/{}/root", drive_id)), token)
            .await?;
        Ok(root.id)
    }

    async fn list_children(
        &self,
        token: &str,
        drive_id: &str,
        item_id: &str,
        page: Option<&str>,
    ) -> Result<ChildrenPage> {
        let url = match page {
            Some(next) => next.to_string(),
            None => self.url(&format!("drives/{}/items/{}/children", drive_id, item_id)),
        };
        self.get_json(&url, token).await
    }

    async fn download(&self, token: &str, drive_id: &str, item_id: &str) -> Result<ContentReader> {
        let url = self.url(&format!("drives/{}/items/{}/content", drive_id, item_id));
        let resp = self.get(&url, token).await?;

        let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }
}
