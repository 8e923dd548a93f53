//! Amazon S3 (and S3-compatible) backend.

use super::{object_key, read_full, storage_error, CopyOutcome};
use crate::config::S3Config;
use crate::utils::{BackupError, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Multipart part size; content smaller than one part goes up as a single PutObject.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Keys `snapshots/{date}/...` and `deleted/{date}/...` inside one bucket.
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_config(config: &S3Config) -> Result<Self> {
        let bucket = config
            .bucket_name
            .clone()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| BackupError::Config("s3 backend requires s3.bucket_name".to_string()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = config.region_name.clone().filter(|r| !r.is_empty()) {
            loader = loader.region(Region::new(region));
        }

        // Explicit keys win over the default provider chain
        if let (Some(key_id), Some(secret)) = (&config.aws_access_key_id, &config.aws_secret_access_key) {
            loader = loader.credentials_provider(Credentials::new(
                key_id.clone(),
                secret.clone(),
                None,
                None,
                "library-backup-config",
            ));
        }

        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        info!("S3 backend initialized: bucket={}", bucket);

        Ok(Self::new(Client::from_conf(s3_config), bucket))
    }

    pub async fn write<R>(&self, base: &str, relative_path: &str, mut content: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let key = object_key(base, relative_path);
        let mut buf = vec![0u8; PART_SIZE];
        let first = read_full(&mut content, &mut buf).await?;

        if first < PART_SIZE {
            buf.truncate(first);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| storage_error(&format!("put s3://{}/{}", self.bucket, key), DisplayErrorContext(e)))?;

            debug!("Uploaded {} bytes to s3://{}/{}", first, self.bucket, key);
            return Ok(());
        }

        self.upload_multipart(&key, buf, content).await
    }

    /// Multipart upload; `buf` already holds the first full part
    async fn upload_multipart<R>(&self, key: &str, mut buf: Vec<u8>, mut content: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("create multipart upload", DisplayErrorContext(e)))?;

        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| BackupError::Storage("no upload id returned".to_string()))?
            .to_string();

        match self.upload_parts(key, &upload_id, &mut buf, &mut content).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| storage_error("complete multipart upload", DisplayErrorContext(e)))?;

                debug!("Multipart upload completed: s3://{}/{}", self.bucket, key);
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("Failed to abort multipart upload {}: {}", upload_id, DisplayErrorContext(abort));
                }
                Err(e)
            }
        }
    }

    async fn upload_parts<R>(
        &self,
        key: &str,
        upload_id: &str,
        buf: &mut [u8],
        content: &mut R,
    ) -> Result<Vec<CompletedPart>>
    where
        R: AsyncRead + Unpin,
    {
        let mut parts = Vec::new();
        let mut part_number = 1;
        let mut len = buf.len();

        while len > 0 {
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf[..len].to_vec()))
                .send()
                .await
                .map_err(|e| storage_error(&format!("upload part {}", part_number), DisplayErrorContext(e)))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(uploaded.e_tag().unwrap_or(""))
                    .build(),
            );

            part_number += 1;
            len = read_full(content, buf).await?;
        }

        Ok(parts)
    }

    // TODO: CopyObject is limited to 5 GiB sources; larger objects need UploadPartCopy.
    pub async fn copy(&self, source_base: &str, relative_path: &str, destination_base: &str) -> CopyOutcome {
        let source_key = object_key(source_base, relative_path);
        let destination_key = object_key(destination_base, relative_path);

        if let Err(e) = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&source_key)
            .send()
            .await
        {
            let service_error = e.into_service_error();
            if service_error.is_not_found() {
                return CopyOutcome::NotFound;
            }
            return CopyOutcome::Failed(format!("head {}: {}", source_key, service_error));
        }

        match self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(copy_source(&self.bucket, &source_key))
            .key(&destination_key)
            .send()
            .await
        {
            Ok(_) => CopyOutcome::Copied,
            Err(e) => CopyOutcome::Failed(format!(
                "copy {} -> {}: {}",
                source_key,
                destination_key,
                DisplayErrorContext(e)
            )),
        }
    }
}

/// `x-amz-copy-source` value: `bucket/key` with the key percent-encoded
fn copy_source(bucket: &str, key: &str) -> String {
    let mut encoded = String::with_capacity(bucket.len() + key.len() + 1);
    encoded.push_str(bucket);
    encoded.push('/');

    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }

    encoded
}
