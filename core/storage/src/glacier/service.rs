//! Glacier implementation of [`BackupService`].

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use stowage_common::cancel::run_cancellable;
use stowage_common::transfer::write_stream;
use stowage_common::{
    BackupEntry, ByteRange, CancellationToken, ChunkReader, EntryInfo, Error, NamePattern,
    PollConfig, ProgressCallback, ProgressTracker, Result, RetryConfig, SizedStream,
};

use super::api::{GlacierApi, JobRequest};
use super::client::{GlacierClient, GlacierConnection};
use super::inventory::{encode_description, ArchiveIndex, ArchiveRecord, Inventory};
use super::job::run_job;
use super::tree_hash::{combine, leaf_hashes, LEAF_SIZE};
use crate::s3::service::{default_max_retries, default_timeout_secs};
use crate::service::{once_listing, BackupService, EntryStream, ProviderKind};
use crate::sigv4::AwsCredentials;

/// Glacier provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GlacierConfig {
    /// Vault name.
    pub vault: String,
    pub region: String,
    #[serde(flatten)]
    pub credentials: AwsCredentials,
    /// Owning account; `-` means the credentials' account.
    #[serde(default = "default_account_id")]
    pub account_id: String,
    /// Custom endpoint, mainly for tests against local fakes.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Multipart part size in MiB; a power of two up to 4096.
    #[serde(default = "default_part_size_mib")]
    pub part_size_mib: u64,
    #[serde(default = "default_job_poll")]
    pub inventory_poll: PollConfig,
    #[serde(default = "default_job_poll")]
    pub retrieval_poll: PollConfig,
    /// Retrieval tier: `Expedited`, `Standard` or `Bulk`.
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_account_id() -> String {
    "-".to_string()
}

fn default_part_size_mib() -> u64 {
    8
}

fn default_tier() -> String {
    "Standard".to_string()
}

/// Jobs usually finish within 3-5 hours (Standard tier).
fn default_job_poll() -> PollConfig {
    PollConfig::fixed(48, Duration::from_secs(15 * 60))
}

/// Runtime knobs of [`GlacierService`].
#[derive(Debug, Clone)]
pub struct GlacierOptions {
    /// Multipart part size in bytes.
    pub part_size: u64,
    pub inventory_poll: RetryConfig,
    pub retrieval_poll: RetryConfig,
}

impl Default for GlacierOptions {
    fn default() -> Self {
        Self {
            part_size: default_part_size_mib() * LEAF_SIZE as u64,
            inventory_poll: default_job_poll().to_retry_config(),
            retrieval_poll: default_job_poll().to_retry_config(),
        }
    }
}

/// Local change not yet reflected by an inventory.
#[derive(Debug, Clone)]
enum JournalEntry {
    Added(ArchiveRecord),
    Removed(String),
}

/// Last inventory plus the changes made since it was taken.
#[derive(Default)]
struct InventoryCache {
    inventory: Option<Vec<ArchiveRecord>>,
    journal: Vec<JournalEntry>,
    index: Option<Arc<ArchiveIndex>>,
}

impl InventoryCache {
    fn build_index(&self) -> ArchiveIndex {
        let removed: HashSet<&str> = self
            .journal
            .iter()
            .filter_map(|change| match change {
                JournalEntry::Removed(id) => Some(id.as_str()),
                JournalEntry::Added(_) => None,
            })
            .collect();
        let added = self.journal.iter().filter_map(|change| match change {
            JournalEntry::Added(record) => Some(record),
            JournalEntry::Removed(_) => None,
        });

        let records = self
            .inventory
            .iter()
            .flatten()
            .chain(added)
            .filter(|record| !removed.contains(record.archive_id.as_str()))
            .cloned();
        ArchiveIndex::build(records)
    }

    /// Install a fresh inventory, dropping journal entries it already
    /// reflects.
    fn install(&mut self, records: Vec<ArchiveRecord>) {
        let listed: HashSet<&str> = records.iter().map(|r| r.archive_id.as_str()).collect();
        let before = self.journal.len();
        self.journal.retain(|change| match change {
            JournalEntry::Added(record) => !listed.contains(record.archive_id.as_str()),
            JournalEntry::Removed(id) => listed.contains(id.as_str()),
        });
        debug!(
            "Inventory has {} archives; {} of {} journal entries still pending",
            records.len(),
            self.journal.len(),
            before
        );
        self.inventory = Some(records);
        self.index = None;
    }

    fn record(&mut self, change: JournalEntry) {
        // A removal cancels a pending upload of the same archive.
        if let JournalEntry::Removed(id) = &change {
            self.journal.retain(|pending| match pending {
                JournalEntry::Added(record) => record.archive_id != *id,
                JournalEntry::Removed(_) => true,
            });
        }
        self.journal.push(change);
        self.index = None;
    }
}

/// Glacier backup service.
///
/// Glacier only knows archives. Each archive description encodes the full
/// path of its entry, and listings come from an inventory job that can take
/// hours. The inventory is cached per instance together with a journal of
/// local uploads and deletes, so changes made through this instance are
/// visible before the next inventory reflects them.
///
/// Several archives may share a path. The newest one (by creation date,
/// then archive id) is the one listed, resolved and downloaded; deleting a
/// path removes all of them. Uploading to an existing path adds a newer
/// version.
///
/// Inventory jobs run outside the cache lock. Only one runs at a time per
/// instance; callers needing the first inventory wait for it, while uploads
/// and deletes only touch the cache briefly to journal their changes.
pub struct GlacierService {
    api: Arc<dyn GlacierApi>,
    options: GlacierOptions,
    cache: Mutex<InventoryCache>,
    inventory_job: Mutex<()>,
}

impl GlacierService {
    /// Create a service over a vault API.
    pub fn new(api: Arc<dyn GlacierApi>, options: GlacierOptions) -> Self {
        Self {
            api,
            options,
            cache: Mutex::new(InventoryCache::default()),
            inventory_job: Mutex::new(()),
        }
    }

    /// Run an inventory job and replace the cached inventory.
    pub async fn refresh_inventory(&self, token: &CancellationToken) -> Result<()> {
        let _job = run_cancellable(token, async { Ok(self.inventory_job.lock().await) }).await?;
        let records = self.fetch_inventory(token).await?;
        self.cache.lock().await.install(records);
        Ok(())
    }

    async fn has_inventory(&self) -> bool {
        self.cache.lock().await.inventory.is_some()
    }

    async fn fetch_inventory(&self, token: &CancellationToken) -> Result<Vec<ArchiveRecord>> {
        let job = run_job(
            self.api.as_ref(),
            JobRequest::Inventory,
            &self.options.inventory_poll,
            token,
        )
        .await?;
        let chunks: Vec<bytes::Bytes> = self
            .api
            .get_job_output(job.id(), None, token)
            .await?
            .try_collect()
            .await?;
        let inventory: Inventory = serde_json::from_slice(&chunks.concat())?;
        info!(
            "Fetched inventory of {} ({} archives, taken {})",
            inventory.vault_arn,
            inventory.archive_list.len(),
            inventory.inventory_date
        );
        Ok(inventory.archive_list)
    }

    /// Current path index, fetching the first inventory if needed.
    async fn index(&self, token: &CancellationToken) -> Result<Arc<ArchiveIndex>> {
        if !self.has_inventory().await {
            let _job =
                run_cancellable(token, async { Ok(self.inventory_job.lock().await) }).await?;
            // Fetched by another caller while this one waited.
            if !self.has_inventory().await {
                let records = self.fetch_inventory(token).await?;
                self.cache.lock().await.install(records);
            }
        }

        let mut cache = self.cache.lock().await;
        if let Some(index) = &cache.index {
            return Ok(index.clone());
        }
        let index = Arc::new(cache.build_index());
        cache.index = Some(index.clone());
        Ok(index)
    }

    /// Every archive stored at the entry's path, newest first.
    pub async fn archives_at(
        &self,
        entry: &BackupEntry,
        token: &CancellationToken,
    ) -> Result<Vec<ArchiveRecord>> {
        let segments = entry.segments()?;
        let index = self.index(token).await?;
        Ok(index.versions(&segments).to_vec())
    }

    async fn upload_archive(
        &self,
        description: &str,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<ArchiveRecord> {
        let size = source.len();
        let part_size = self.options.part_size;
        let upload_id = self
            .api
            .initiate_multipart_upload(description, part_size, token)
            .await?;
        debug!("Started Glacier upload {} for '{}'", upload_id, description);

        let outcome: Result<ArchiveRecord> = async {
            let mut reader = ChunkReader::new(source.into_checked_stream());
            let mut tracker = ProgressTracker::new(progress);
            let mut leaves = Vec::new();
            let mut offset = 0u64;

            while let Some(part) = reader.read_chunk(part_size as usize, token).await? {
                let part_leaves = leaf_hashes(&part);
                let part_hash = hex::encode(combine(&part_leaves));
                let len = part.len() as u64;
                self.api
                    .upload_part(&upload_id, offset, part, &part_hash, token)
                    .await?;
                leaves.extend(part_leaves);
                offset += len;
                tracker.advance(len);
            }

            let tree_hash = hex::encode(combine(&leaves));
            let archive_id = self
                .api
                .complete_multipart_upload(&upload_id, size, &tree_hash, token)
                .await?;
            Ok(ArchiveRecord {
                archive_id,
                archive_description: description.to_string(),
                creation_date: Utc::now(),
                size,
                sha256_tree_hash: tree_hash,
            })
        }
        .await;

        if let Err(err) = &outcome {
            warn!("Glacier upload {} failed: {}; aborting", upload_id, err);
            let abort_token = CancellationToken::new();
            if let Err(abort_err) = self.api.abort_multipart_upload(&upload_id, &abort_token).await
            {
                warn!("Failed to abort Glacier upload {}: {}", upload_id, abort_err);
            }
        }
        outcome
    }

    async fn delete_archives(
        &self,
        archive_ids: Vec<String>,
        token: &CancellationToken,
    ) -> Result<()> {
        for archive_id in archive_ids {
            match self.api.delete_archive(&archive_id, token).await {
                Ok(()) => {}
                // Deleted elsewhere after the inventory was taken.
                Err(Error::NotFound(message)) => debug!("{}", message),
                Err(err) => return Err(err),
            }
            self.cache
                .lock()
                .await
                .record(JournalEntry::Removed(archive_id));
        }
        Ok(())
    }
}

#[async_trait]
impl BackupService for GlacierService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AmazonGlacier
    }

    fn can_folders(&self) -> bool {
        false
    }

    async fn create_folder(&self, entry: &BackupEntry, _token: &CancellationToken) -> Result<()> {
        // Folders exist through the descriptions of the archives below them.
        encode_description(entry.segments()?.as_slice())?;
        Ok(())
    }

    fn find(
        &self,
        parent: Option<BackupEntry>,
        pattern: Option<NamePattern>,
        token: CancellationToken,
    ) -> EntryStream<'_> {
        once_listing(async move {
            let segments = match &parent {
                Some(parent) => parent.segments()?,
                None => Vec::new(),
            };
            let index = self.index(&token).await;
            index
                .and_then(|index| index.children(&segments, pattern.as_ref()))
                .map_err(|e| e.at("glacier", &segments.join("/")))
        })
    }

    async fn fill_info(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let segments = entry.segments()?;
        let path = segments.join("/");
        let index = self
            .index(token)
            .await
            .map_err(|e| e.at("glacier", &path))?;

        if let Some(newest) = index.newest(&segments) {
            entry.set_info(newest.info());
            Ok(())
        } else if index.has_folder(&segments) {
            entry.set_info(EntryInfo::default());
            Ok(())
        } else {
            Err(Error::NotFound("No archive at this path".to_string()).at("glacier", &path))
        }
    }

    async fn upload(
        &self,
        entry: &BackupEntry,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<()> {
        let segments = entry.segments()?;
        let path = segments.join("/");
        let result: Result<ArchiveRecord> = async {
            if source.is_empty() {
                return Err(Error::InvalidInput(
                    "Glacier cannot store an empty archive".to_string(),
                ));
            }
            let description = encode_description(segments.as_slice())?;
            self.upload_archive(&description, source, progress, token)
                .await
        }
        .await;
        let record = result.map_err(|e| e.at("glacier", &path))?;

        info!(
            "Uploaded {} as archive {} ({} bytes)",
            path, record.archive_id, record.size
        );
        entry.set_info(record.info());
        self.cache.lock().await.record(JournalEntry::Added(record));
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
        let segments = entry.segments()?;
        let path = segments.join("/");
        let result: Result<u64> = async {
            let index = self.index(token).await?;
            let record = index
                .newest(&segments)
                .ok_or_else(|| Error::NotFound("No archive at this path".to_string()))?;
            if let Some(range) = &range {
                range.resolve(record.size)?;
            }

            let request = JobRequest::ArchiveRetrieval {
                archive_id: record.archive_id.clone(),
            };
            let job = run_job(
                self.api.as_ref(),
                request,
                &self.options.retrieval_poll,
                token,
            )
            .await?;
            let stream = self.api.get_job_output(job.id(), range, token).await?;
            let mut tracker = ProgressTracker::new(progress);
            write_stream(stream, dest, &mut tracker, token).await
        }
        .await;
        result.map_err(|e| e.at("glacier", &path))
    }

    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let segments = entry.segments()?;
        let path = segments.join("/");
        let result: Result<()> = async {
            let index = self.index(token).await?;
            let mut targets: Vec<String> = index
                .versions(&segments)
                .iter()
                .map(|r| r.archive_id.clone())
                .collect();
            if targets.is_empty() {
                targets = index
                    .below(&segments)
                    .into_iter()
                    .map(|r| r.archive_id.clone())
                    .collect();
            }
            if targets.is_empty() {
                return Err(Error::NotFound("No archive at this path".to_string()));
            }
            let count = targets.len();
            self.delete_archives(targets, token).await?;
            info!("Deleted {} archive(s) at {}", count, path);
            Ok(())
        }
        .await;
        result.map_err(|e| e.at("glacier", &path))
    }

    async fn publish(
        &self,
        entry: &BackupEntry,
        _expires_in: Option<Duration>,
        _token: &CancellationToken,
    ) -> Result<String> {
        Err(Error::NotSupported("Glacier archives cannot be shared".to_string())
            .at("glacier", &entry.full_path()?))
    }

    async fn unpublish(&self, entry: &BackupEntry, _token: &CancellationToken) -> Result<()> {
        Err(Error::NotSupported("Glacier archives cannot be shared".to_string())
            .at("glacier", &entry.full_path()?))
    }
}

/// Create a Glacier service from a JSON config.
pub fn create_glacier_service(config: Value) -> Result<Arc<dyn BackupService>> {
    let config: GlacierConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid Glacier config: {}", e)))?;
    if config.vault.is_empty() {
        return Err(Error::InvalidInput("Glacier vault name is empty".to_string()));
    }
    if !config.part_size_mib.is_power_of_two() || config.part_size_mib > 4096 {
        return Err(Error::InvalidInput(format!(
            "Glacier part size must be a power of two up to 4096 MiB, got {}",
            config.part_size_mib
        )));
    }

    let options = GlacierOptions {
        part_size: config.part_size_mib * LEAF_SIZE as u64,
        inventory_poll: config.inventory_poll.to_retry_config(),
        retrieval_poll: config.retrieval_poll.to_retry_config(),
    };
    let client = GlacierClient::new(GlacierConnection {
        region: config.region,
        vault: config.vault,
        account_id: config.account_id,
        credentials: config.credentials,
        endpoint: config.endpoint,
        tier: config.tier,
        timeout: Duration::from_secs(config.timeout_secs),
        max_retries: config.max_retries,
    })?;
    Ok(Arc::new(GlacierService::new(Arc::new(client), options)))
}
