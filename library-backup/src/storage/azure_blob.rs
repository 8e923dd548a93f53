//! Azure Blob Storage backend over the Blob REST API.
//!
//! Requests are authorized with Shared Key (account key from the connection
//! string) or a SAS token. Blob storage has no server-side copy without a
//! source URL the service can reach, so `copy` streams the source blob back
//! through `write`.

use super::{object_key, read_full, storage_error, CopyOutcome};
use crate::config::AzureBlobConfig;
use crate::utils::{BackupError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";
const OCTET_STREAM: &str = "application/octet-stream";

/// Block size for staged uploads; smaller content goes up as one Put Blob.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

// Well-known Azurite development account
const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// Parsed storage-account connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub blob_endpoint: String,
    pub sas_token: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for segment in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, value) = segment.split_once('=').ok_or_else(|| {
                BackupError::Config("malformed azure connection string segment".to_string())
            })?;
            fields.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        if fields
            .get("usedevelopmentstorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Ok(Self {
                account_name: Some(DEV_ACCOUNT.to_string()),
                account_key: Some(DEV_ACCOUNT_KEY.to_string()),
                blob_endpoint: DEV_BLOB_ENDPOINT.to_string(),
                sas_token: None,
            });
        }

        let account_name = fields.remove("accountname");
        let account_key = fields.remove("accountkey");
        let sas_token = fields
            .remove("sharedaccesssignature")
            .map(|s| s.trim_start_matches('?').to_string());

        let blob_endpoint = match fields.remove("blobendpoint") {
            Some(endpoint) => endpoint,
            None => {
                let account = account_name.as_deref().ok_or_else(|| {
                    BackupError::Config("azure connection string needs AccountName or BlobEndpoint".to_string())
                })?;
                let protocol = fields
                    .get("defaultendpointsprotocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = fields
                    .get("endpointsuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{}://{}.blob.{}", protocol, account, suffix)
            }
        };

        Ok(Self {
            account_name,
            account_key,
            blob_endpoint,
            sas_token,
        })
    }
}

#[derive(Clone)]
enum Authorization {
    SharedKey { account: String, key: Vec<u8> },
    Sas(String),
}

/// Blobs `snapshots/{date}/...` and `deleted/{date}/...` inside one container.
#[derive(Clone)]
pub struct AzureBlobStorage {
    http: reqwest::Client,
    endpoint: Url,
    container: String,
    auth: Authorization,
}

impl std::fmt::Debug for AzureBlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobStorage")
            .field("endpoint", &self.endpoint.as_str())
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl AzureBlobStorage {
    pub fn new(http: reqwest::Client, connection: &ConnectionString, container: impl Into<String>) -> Result<Self> {
        let endpoint = Url::parse(&connection.blob_endpoint)
            .map_err(|e| BackupError::Config(format!("invalid blob endpoint: {}", e)))?;

        let auth = match (&connection.account_name, &connection.account_key, &connection.sas_token) {
            (Some(account), Some(key), _) => Authorization::SharedKey {
                account: account.clone(),
                key: STANDARD
                    .decode(key)
                    .map_err(|e| BackupError::Config(format!("invalid azure account key: {}", e)))?,
            },
            (_, _, Some(sas)) => Authorization::Sas(sas.clone()),
            _ => {
                return Err(BackupError::Config(
                    "azure connection string needs AccountName+AccountKey or SharedAccessSignature".to_string(),
                ))
            }
        };

        Ok(Self {
            http,
            endpoint,
            container: container.into(),
            auth,
        })
    }

    pub async fn from_config(config: &AzureBlobConfig) -> Result<Self> {
        let raw = config
            .connection_string
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BackupError::Config("azure_blob backend requires azure_blob.connection_string".to_string()))?;
        let container = config
            .container_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BackupError::Config("azure_blob backend requires azure_blob.container_name".to_string()))?;

        let storage = Self::new(reqwest::Client::new(), &ConnectionString::parse(raw)?, container)?;
        storage.create_container().await;

        info!("Azure Blob backend initialized: container={}", storage.container);
        Ok(storage)
    }

    /// Create the container if missing; failures are logged, not fatal,
    /// since the credentials may allow writing blobs but not creating containers.
    async fn create_container(&self) {
        let mut url = match self.container_url() {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot build container URL: {}", e);
                return;
            }
        };
        url.query_pairs_mut().append_pair("restype", "container");

        match self.send(Method::PUT, url, None, Some(Bytes::new()), &[]).await {
            Ok(resp) if resp.status().is_success() => debug!("Created container {}", self.container),
            Ok(resp) if resp.status() == StatusCode::CONFLICT => {}
            Ok(resp) => warn!("Container create for {} returned {}", self.container, resp.status()),
            Err(e) => warn!("Container create for {} failed: {}", self.container, e),
        }
    }

    pub async fn write<R>(&self, base: &str, relative_path: &str, mut content: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let key = object_key(base, relative_path);
        let url = self.blob_url(&key)?;

        let mut buf = vec![0u8; BLOCK_SIZE];
        let first = read_full(&mut content, &mut buf).await?;

        if first < BLOCK_SIZE {
            buf.truncate(first);
            let resp = self
                .send(
                    Method::PUT,
                    url,
                    Some(OCTET_STREAM),
                    Some(Bytes::from(buf)),
                    &[("x-ms-blob-type", "BlockBlob".to_string())],
                )
                .await?;
            return expect_success(resp, "put blob", &key).await;
        }

        let mut block_ids = Vec::new();
        let mut len = first;
        while len > 0 {
            let id = block_id(block_ids.len());
            let mut block_url = url.clone();
            block_url
                .query_pairs_mut()
                .append_pair("comp", "block")
                .append_pair("blockid", &id);

            let resp = self
                .send(Method::PUT, block_url, Some(OCTET_STREAM), Some(Bytes::copy_from_slice(&buf[..len])), &[])
                .await?;
            expect_success(resp, "put block", &key).await?;

            block_ids.push(id);
            len = read_full(&mut content, &mut buf).await?;
        }

        let mut list_url = url;
        list_url.query_pairs_mut().append_pair("comp", "blocklist");
        let resp = self
            .send(
                Method::PUT,
                list_url,
                Some("application/xml"),
                Some(Bytes::from(block_list_xml(&block_ids))),
                &[],
            )
            .await?;
        expect_success(resp, "put block list", &key).await?;

        debug!("Uploaded {} blocks to {}", block_ids.len(), key);
        Ok(())
    }

    pub async fn copy(&self, source_base: &str, relative_path: &str, destination_base: &str) -> CopyOutcome {
        let source_key = object_key(source_base, relative_path);
        let url = match self.blob_url(&source_key) {
            Ok(url) => url,
            Err(e) => return CopyOutcome::Failed(e.to_string()),
        };

        let resp = match self.send(Method::GET, url, None, None, &[]).await {
            Ok(resp) => resp,
            Err(e) => return CopyOutcome::Failed(format!("get {}: {}", source_key, e)),
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return CopyOutcome::NotFound;
        }
        if !status.is_success() {
            return CopyOutcome::Failed(format!("get {} returned {}", source_key, status));
        }

        let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        match self.write(destination_base, relative_path, StreamReader::new(stream)).await {
            Ok(()) => CopyOutcome::Copied,
            Err(e) => CopyOutcome::Failed(e.to_string()),
        }
    }

    fn container_url(&self) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BackupError::Config("blob endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push(&self.container);
        Ok(url)
    }

    fn blob_url(&self, key: &str) -> Result<Url> {
        let mut url = self.container_url()?;
        url.path_segments_mut()
            .map_err(|_| BackupError::Config("blob endpoint cannot be a base URL".to_string()))?
            .extend(key.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    /// Sign (or SAS-authorize) and send one request. PUTs should pass a body,
    /// even an empty one, so a Content-Length header is always sent.
    async fn send(
        &self,
        method: Method,
        mut url: Url,
        content_type: Option<&str>,
        body: Option<Bytes>,
        extra_headers: &[(&'static str, String)],
    ) -> Result<reqwest::Response> {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("x-ms-date"), header_value(&http_date())?);
        headers.insert(HeaderName::from_static("x-ms-version"), HeaderValue::from_static(API_VERSION));
        for (name, value) in extra_headers {
            headers.insert(HeaderName::from_static(*name), header_value(value)?);
        }
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, header_value(content_type)?);
        }

        let content_length = body.as_ref().map_or(0, Bytes::len);

        match &self.auth {
            Authorization::SharedKey { account, key } => {
                let to_sign = string_to_sign(&method, &url, &headers, content_length, account);
                let signature = sign(key, &to_sign)?;
                headers.insert(AUTHORIZATION, header_value(&format!("SharedKey {}:{}", account, signature))?);
            }
            Authorization::Sas(token) => {
                let query = match url.query() {
                    Some(existing) if !existing.is_empty() => format!("{}&{}", existing, token),
                    _ => token.clone(),
                };
                url.set_query(Some(&query));
            }
        }

        let mut request = self.http.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }
}

async fn expect_success(resp: reqwest::Response, operation: &str, key: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackupError::Storage(format!("{} {} returned {}: {}", operation, key, status, body)))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| storage_error("invalid header value", e))
}

fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Block ids must all have the same length within one blob
fn block_id(index: usize) -> String {
    STANDARD.encode(format!("block-{:06}", index))
}

fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Shared Key string-to-sign for the Blob service (version 2015-02-21 and later)
fn string_to_sign(method: &Method, url: &Url, headers: &HeaderMap, content_length: usize, account: &str) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let standard = [
        method.as_str().to_string(),
        header("content-encoding"),
        header("content-language"),
        length,
        header("content-md5"),
        header("content-type"),
        header("date"),
        header("if-modified-since"),
        header("if-match"),
        header("if-none-match"),
        header("if-unmodified-since"),
        header("range"),
    ];

    let mut ms_headers: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ms-"))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("").trim().to_string(),
            )
        })
        .collect();
    ms_headers.sort();

    let canonical_headers: String = ms_headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();

    let mut resource = format!("/{}{}", account, url.path());
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        resource.push_str(&format!("\n{}:{}", name, values.join(",")));
    }

    format!("{}\n{}{}", standard.join("\n"), canonical_headers, resource)
}

fn sign(key: &[u8], string_to_sign: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| storage_error("invalid signing key", e))?;
    mac.update(string_to_sign.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}
