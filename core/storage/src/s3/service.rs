//! S3 implementation of [`BackupService`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use stowage_common::pattern::matches_pattern;
use stowage_common::transfer::{with_progress, write_stream};
use stowage_common::{
    poll_until, BackupEntry, ByteRange, CancellationToken, ChunkReader, EntryInfo, EntryKind,
    Error, NamePattern, PollConfig, PollStatus, ProgressCallback, ProgressTracker, Result,
    RetryConfig, SizedStream,
};

use super::client::{clean_etag, CompletedPart, ListBucketResult, S3Client};
use crate::service::{
    child_prefix, entry_at, failed_stream, listing_path, paginate, BackupService, EntryStream,
    ProviderKind,
};
use crate::sigv4::AwsCredentials;

/// Smallest part S3 accepts (except for the last one).
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts one multipart upload may have.
const MAX_PARTS: u64 = 10_000;

/// S3 provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,
    /// Bucket region, e.g. `eu-central-1`.
    pub region: String,
    /// Access keys.
    #[serde(flatten)]
    pub credentials: AwsCredentials,
    /// Custom endpoint for S3-compatible stores; switches to path-style URLs.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Payloads larger than this use a multipart upload.
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,
    /// Multipart part size.
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// Budget for waiting until an object stops being publicly readable.
    #[serde(default = "default_unpublish_poll")]
    pub unpublish_poll: PollConfig,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for idempotent requests that fail transiently.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_part_size() -> u64 {
    16 * 1024 * 1024
}

fn default_unpublish_poll() -> PollConfig {
    PollConfig {
        max_attempts: 10,
        interval_ms: 500,
        backoff: 2.0,
        max_interval_ms: Some(5_000),
    }
}

pub(crate) fn default_timeout_secs() -> u64 {
    300
}

pub(crate) fn default_max_retries() -> u32 {
    3
}

/// Part size for a payload of `length` bytes.
///
/// Grows past the configured size when the payload would otherwise need
/// more than the maximum part count.
fn part_size_for(configured: u64, length: u64) -> u64 {
    let needed = length.div_ceil(MAX_PARTS);
    configured.max(MIN_PART_SIZE).max(needed)
}

/// Convert one listing page into entries below `prefix`.
fn page_entries(
    prefix: &str,
    page: &ListBucketResult,
    pattern: Option<&NamePattern>,
) -> Result<Vec<BackupEntry>> {
    let mut entries = Vec::new();

    for common in &page.common_prefixes {
        let path = common.prefix.trim_end_matches('/');
        let name = path.strip_prefix(prefix).unwrap_or(path);
        if name.is_empty() || !matches_pattern(pattern, name) {
            continue;
        }
        entries.push(entry_at(path, EntryKind::Folder, EntryInfo::default())?);
    }

    for object in &page.contents {
        // Zero-byte "folder" markers created by consoles.
        if object.key == prefix || object.key.ends_with('/') {
            continue;
        }
        let name = object.key.strip_prefix(prefix).unwrap_or(&object.key);
        if !matches_pattern(pattern, name) {
            continue;
        }
        let info = EntryInfo {
            size: Some(object.size),
            modified: object.last_modified,
            remote_id: object.etag.as_deref().map(clean_etag),
        };
        entries.push(entry_at(&object.key, EntryKind::File, info)?);
    }

    Ok(entries)
}

/// S3 backup service.
pub struct S3Service {
    client: S3Client,
    multipart_threshold: u64,
    part_size: u64,
    unpublish_poll: RetryConfig,
}

impl S3Service {
    /// Create a service from its configuration.
    pub fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::InvalidInput("S3 bucket name is empty".to_string()));
        }
        Ok(Self {
            client: S3Client::new(&config)?,
            multipart_threshold: config.multipart_threshold,
            part_size: config.part_size,
            unpublish_poll: config.unpublish_poll.to_retry_config(),
        })
    }

    async fn folder_exists(&self, path: &str, token: &CancellationToken) -> Result<bool> {
        let page = self
            .client
            .list_page(&child_prefix(path), None, None, Some(1), token)
            .await?;
        Ok(!page.contents.is_empty())
    }

    async fn upload_multipart(
        &self,
        key: &str,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<()> {
        let part_size = part_size_for(self.part_size, source.len());
        let upload_id = self.client.create_multipart(key, token).await?;
        debug!("Started multipart upload {} for {}", upload_id, key);

        let outcome: Result<()> = async {
            let mut reader = ChunkReader::new(source.into_checked_stream());
            let mut tracker = ProgressTracker::new(progress);
            let mut parts = Vec::new();
            let mut part_number = 1u32;

            while let Some(chunk) = reader.read_chunk(part_size as usize, token).await? {
                let len = chunk.len() as u64;
                let etag = self
                    .client
                    .upload_part(key, &upload_id, part_number, chunk, token)
                    .await?;
                parts.push(CompletedPart { part_number, etag });
                tracker.advance(len);
                part_number += 1;
            }

            self.client
                .complete_multipart(key, &upload_id, &parts, token)
                .await
        }
        .await;

        if let Err(err) = &outcome {
            warn!("Multipart upload of {} failed: {}; aborting", key, err);
            // The caller's token may already be cancelled.
            let abort_token = CancellationToken::new();
            if let Err(abort_err) = self
                .client
                .abort_multipart(key, &upload_id, &abort_token)
                .await
            {
                warn!("Failed to abort multipart upload {}: {}", upload_id, abort_err);
            }
        }
        outcome
    }

    async fn delete_prefix(&self, path: &str, token: &CancellationToken) -> Result<()> {
        let prefix = child_prefix(path);
        let mut continuation: Option<String> = None;
        let mut deleted = 0usize;
        loop {
            let page = self
                .client
                .list_page(&prefix, None, continuation.as_deref(), None, token)
                .await?;
            for object in &page.contents {
                self.client.delete_object(&object.key, token).await?;
                deleted += 1;
            }
            match page.next_page() {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        if deleted == 0 {
            return Err(Error::NotFound("No objects below this folder".to_string()));
        }
        info!("Deleted {} objects below {}", deleted, path);
        Ok(())
    }
}

#[async_trait]
impl BackupService for S3Service {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AmazonS3
    }

    fn can_folders(&self) -> bool {
        false
    }

    async fn create_folder(&self, entry: &BackupEntry, _token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        debug!("S3 folders are implicit; nothing to create for {}", path);
        Ok(())
    }

    fn find(
        &self,
        parent: Option<BackupEntry>,
        pattern: Option<NamePattern>,
        token: CancellationToken,
    ) -> EntryStream<'_> {
        let path = match listing_path(parent.as_ref()) {
            Ok(path) => path,
            Err(err) => return failed_stream(err),
        };
        let prefix = child_prefix(&path);

        paginate(move |cursor: Option<String>| {
            let prefix = prefix.clone();
            let path = path.clone();
            let pattern = pattern.clone();
            let token = token.clone();
            async move {
                let page = self
                    .client
                    .list_page(&prefix, Some("/"), cursor.as_deref(), None, &token)
                    .await
                    .map_err(|e| e.at("s3", &path))?;
                let entries = page_entries(&prefix, &page, pattern.as_ref())?;
                Ok((entries, page.next_page()))
            }
        })
    }

    async fn fill_info(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<EntryInfo> = async {
            if entry.is_folder() {
                if self.folder_exists(&path, token).await? {
                    return Ok(EntryInfo::default());
                }
                return Err(Error::NotFound("No objects below this folder".to_string()));
            }
            let head = self.client.head_object(&path, token).await?;
            Ok(EntryInfo {
                size: Some(head.size),
                modified: head.modified,
                remote_id: head.etag,
            })
        }
        .await;
        entry.set_info(result.map_err(|e| e.at("s3", &path))?);
        Ok(())
    }

    async fn upload(
        &self,
        entry: &BackupEntry,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<()> {
        let path = entry.full_path()?;
        let length = source.len();
        let result = if length > self.multipart_threshold {
            self.upload_multipart(&path, source, progress, token).await
        } else {
            let body = with_progress(source.into_checked_stream(), progress);
            self.client
                .put_object(&path, body, length, token)
                .await
                .map(|_| ())
        };
        result.map_err(|e| e.at("s3", &path))?;
        info!("Uploaded {} ({} bytes)", path, length);
        Ok(())
    }

    async fn download(
        &self,
        entry: &BackupEntry,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        range: Option<ByteRange>,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let path = entry.full_path()?;
        let result: Result<u64> = async {
            let stream = self.client.get_object(&path, range, token).await?;
            let mut tracker = ProgressTracker::new(progress);
            write_stream(stream, dest, &mut tracker, token).await
        }
        .await;
        result.map_err(|e| e.at("s3", &path))
    }

    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            if entry.is_folder() {
                return self.delete_prefix(&path, token).await;
            }
            // DELETE succeeds on missing keys; HEAD first so absence is reported.
            self.client.head_object(&path, token).await?;
            self.client.delete_object(&path, token).await
        }
        .await;
        result.map_err(|e| e.at("s3", &path))
    }

    async fn publish(
        &self,
        entry: &BackupEntry,
        expires_in: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<String> {
        let path = entry.full_path()?;
        let result: Result<String> = async {
            if expires_in.is_some() {
                return Err(Error::NotSupported(
                    "Presigned S3 links cannot be revoked".to_string(),
                ));
            }
            self.client.head_object(&path, token).await?;
            self.client.put_acl(&path, "public-read", token).await?;
            Ok(self.client.object_url(&path)?.to_string())
        }
        .await;
        let url = result.map_err(|e| e.at("s3", &path))?;
        info!("Published {}", path);
        Ok(url)
    }

    async fn unpublish(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            self.client.put_acl(&path, "private", token).await?;
            poll_until(&self.unpublish_poll, token, "S3 ACL revocation", || {
                let path = path.as_str();
                async move {
                    Ok(if self.client.is_publicly_readable(path, token).await? {
                        PollStatus::Pending
                    } else {
                        PollStatus::Ready(())
                    })
                }
            })
            .await
        }
        .await;
        result.map_err(|e| e.at("s3", &path))?;
        info!("Unpublished {}", path);
        Ok(())
    }
}

/// Create an S3 service from a JSON configuration.
pub fn create_s3_service(config: Value) -> Result<Arc<dyn BackupService>> {
    let config: S3Config = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid S3 config: {}", e)))?;
    Ok(Arc::new(S3Service::new(config)?))
}
