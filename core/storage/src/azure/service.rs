//! Azure Blob implementation of [`BackupService`].

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use stowage_common::pattern::matches_pattern;
use stowage_common::transfer::{with_progress, write_stream};
use stowage_common::{
    BackupEntry, ByteRange, CancellationToken, ChunkReader, EntryInfo, EntryKind, Error,
    NamePattern, ProgressCallback, ProgressTracker, Result, SizedStream,
};

use super::auth::SharedKey;
use super::client::{block_id, AzureClient, EnumerationResults};
use crate::s3::service::{default_max_retries, default_timeout_secs};
use crate::service::{
    child_prefix, entry_at, failed_stream, listing_path, paginate, BackupService, EntryStream,
    ProviderKind,
};

/// Most blocks one blob may have.
const MAX_BLOCKS: u64 = 50_000;

/// Largest block the service accepts.
const MAX_BLOCK_SIZE: u64 = 4000 * 1024 * 1024;

/// Azure Blob provider configuration.
#[derive(Clone, Deserialize)]
pub struct AzureConfig {
    /// Storage account name.
    pub account: String,
    /// Base64 account access key.
    pub access_key: String,
    pub container: String,
    /// Custom endpoint (e.g. Azurite), including the account path.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Payloads larger than this are uploaded as staged blocks.
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// SAS validity when `publish` is called without an expiry.
    #[serde(default = "default_link_expiry_secs")]
    pub link_expiry_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl std::fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfig")
            .field("account", &self.account)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

fn default_block_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_block_size() -> u64 {
    8 * 1024 * 1024
}

fn default_link_expiry_secs() -> u64 {
    7 * 24 * 60 * 60
}

/// Block size for a payload of `length` bytes.
fn block_size_for(configured: u64, length: u64) -> u64 {
    configured
        .max(length.div_ceil(MAX_BLOCKS))
        .clamp(1, MAX_BLOCK_SIZE)
}

/// Convert one listing page into entries below `prefix`.
fn page_entries(
    prefix: &str,
    page: &EnumerationResults,
    pattern: Option<&NamePattern>,
) -> Result<Vec<BackupEntry>> {
    let mut entries = Vec::new();

    for dir in &page.blobs.prefixes {
        let path = dir.name.trim_end_matches('/');
        let name = path.strip_prefix(prefix).unwrap_or(path);
        if name.is_empty() || !matches_pattern(pattern, name) {
            continue;
        }
        entries.push(entry_at(path, EntryKind::Folder, EntryInfo::default())?);
    }

    for blob in &page.blobs.blobs {
        if blob.name.ends_with('/') {
            continue;
        }
        let name = blob.name.strip_prefix(prefix).unwrap_or(&blob.name);
        if !matches_pattern(pattern, name) {
            continue;
        }
        let info = EntryInfo {
            size: Some(blob.properties.content_length),
            modified: blob.properties.modified(),
            remote_id: blob.properties.etag.clone(),
        };
        entries.push(entry_at(&blob.name, EntryKind::File, info)?);
    }

    Ok(entries)
}

/// Azure Blob backup service.
///
/// Blobs are block blobs named by the entry's full path. Folders are
/// virtual directories derived from the `/` delimiter. Published links are
/// read-only service SAS URLs; they cannot be revoked one by one, so
/// `unpublish` is not supported.
pub struct AzureService {
    client: AzureClient,
    block_threshold: u64,
    block_size: u64,
    link_expiry: Duration,
}

impl AzureService {
    /// Create a service from its configuration.
    pub fn new(config: AzureConfig) -> Result<Self> {
        if config.account.is_empty() || config.container.is_empty() {
            return Err(Error::InvalidInput(
                "Azure account and container must be set".to_string(),
            ));
        }
        let key = SharedKey::new(config.account.clone(), &config.access_key)?;
        let client = AzureClient::new(
            key,
            &config.container,
            config.endpoint.as_deref(),
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            client,
            block_threshold: config.block_threshold,
            block_size: config.block_size,
            link_expiry: Duration::from_secs(config.link_expiry_secs),
        })
    }

    async fn folder_exists(&self, path: &str, token: &CancellationToken) -> Result<bool> {
        let page = self
            .client
            .list_page(&child_prefix(path), None, None, Some(1), token)
            .await?;
        Ok(!page.blobs.blobs.is_empty())
    }

    async fn upload_blocks(
        &self,
        name: &str,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<()> {
        let block_size = block_size_for(self.block_size, source.len());
        let mut reader = ChunkReader::new(source.into_checked_stream());
        let mut tracker = ProgressTracker::new(progress);
        let mut ids = Vec::new();

        while let Some(block) = reader.read_chunk(block_size as usize, token).await? {
            let id = block_id(ids.len() as u32);
            let len = block.len() as u64;
            self.client.put_block(name, &id, block, token).await?;
            ids.push(id);
            tracker.advance(len);
        }
        debug!("Committing {} blocks for {}", ids.len(), name);
        // Uncommitted blocks of a failed upload expire on their own.
        self.client.put_block_list(name, &ids, token).await
    }

    async fn delete_prefix(&self, path: &str, token: &CancellationToken) -> Result<()> {
        let prefix = child_prefix(path);
        let mut marker: Option<String> = None;
        let mut deleted = 0usize;
        loop {
            let page = self
                .client
                .list_page(&prefix, None, marker.as_deref(), None, token)
                .await?;
            for blob in &page.blobs.blobs {
                self.client.delete_blob(&blob.name, token).await?;
                deleted += 1;
            }
            match page.next_page() {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        if deleted == 0 {
            return Err(Error::NotFound("No blobs below this folder".to_string()));
        }
        info!("Deleted {} blobs below {}", deleted, path);
        Ok(())
    }
}

#[async_trait]
impl BackupService for AzureService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureBlob
    }

    fn can_folders(&self) -> bool {
        false
    }

    async fn create_folder(&self, entry: &BackupEntry, _token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        debug!("Azure folders are virtual; nothing to create for {}", path);
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

        paginate(move |marker: Option<String>| {
            let prefix = prefix.clone();
            let path = path.clone();
            let pattern = pattern.clone();
            let token = token.clone();
            async move {
                let page = self
                    .client
                    .list_page(&prefix, Some("/"), marker.as_deref(), None, &token)
                    .await
                    .map_err(|e| e.at("azure", &path))?;
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
                return Err(Error::NotFound("No blobs below this folder".to_string()));
            }
            let head = self.client.get_properties(&path, token).await?;
            Ok(EntryInfo {
                size: Some(head.size),
                modified: head.modified,
                remote_id: head.etag,
            })
        }
        .await;
        entry.set_info(result.map_err(|e| e.at("azure", &path))?);
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
        let result = if length > self.block_threshold {
            self.upload_blocks(&path, source, progress, token).await
        } else {
            let body = with_progress(source.into_checked_stream(), progress);
            self.client.put_blob(&path, body, length, token).await
        };
        if let Err(err) = &result {
            warn!("Upload of {} failed: {}", path, err);
        }
        result.map_err(|e| e.at("azure", &path))?;
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
            let stream = self.client.get_blob(&path, range, token).await?;
            let mut tracker = ProgressTracker::new(progress);
            write_stream(stream, dest, &mut tracker, token).await
        }
        .await;
        result.map_err(|e| e.at("azure", &path))
    }

    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result = if entry.is_folder() {
            self.delete_prefix(&path, token).await
        } else {
            self.client.delete_blob(&path, token).await
        };
        result.map_err(|e| e.at("azure", &path))
    }

    async fn publish(
        &self,
        entry: &BackupEntry,
        expires_in: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<String> {
        let path = entry.full_path()?;
        let result: Result<String> = async {
            if entry.is_folder() {
                return Err(Error::NotSupported(
                    "Azure folders cannot be published".to_string(),
                ));
            }
            self.client.get_properties(&path, token).await?;
            let validity = expires_in.unwrap_or(self.link_expiry);
            let validity = chrono::Duration::from_std(validity)
                .map_err(|e| Error::InvalidInput(format!("Link expiry out of range: {}", e)))?;
            self.client.sas_url(&path, Utc::now() + validity)
        }
        .await;
        result.map_err(|e| e.at("azure", &path))
    }

    async fn unpublish(&self, entry: &BackupEntry, _token: &CancellationToken) -> Result<()> {
        Err(Error::NotSupported(
            "Shared access signatures cannot be revoked individually".to_string(),
        )
        .at("azure", &entry.full_path()?))
    }
}

/// Create an Azure Blob service from a JSON configuration.
pub fn create_azure_service(config: Value) -> Result<Arc<dyn BackupService>> {
    let config: AzureConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid Azure config: {}", e)))?;
    Ok(Arc::new(AzureService::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_xml;
    use crate::testing::{self, escape};
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::Router;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Container `backups` of account `acct`, reachable below `/acct`.
    #[derive(Default)]
    struct Container {
        blobs: BTreeMap<String, Vec<u8>>,
        /// Staged blocks by blob name and block id.
        staged: HashMap<(String, String), Vec<u8>>,
        committed_blocks: usize,
    }

    type FakeContainer = Arc<Mutex<Container>>;

    const PAGE_SIZE: usize = 2;

    impl Container {
        fn list(&self, params: &HashMap<String, String>) -> Response {
            let prefix = params.get("prefix").map(String::as_str).unwrap_or_default();
            let delimiter = params.get("delimiter");
            let max_results = params
                .get("maxresults")
                .and_then(|v| v.parse().ok())
                .unwrap_or(PAGE_SIZE)
                .min(PAGE_SIZE);

            // Name to size; virtual directories have none.
            let mut items: BTreeMap<String, Option<usize>> = BTreeMap::new();
            let below = self
                .blobs
                .range(prefix.to_string()..)
                .take_while(|(name, _)| name.starts_with(prefix));
            for (name, data) in below {
                let rest = &name[prefix.len()..];
                match delimiter.and_then(|d| rest.find(d.as_str()).map(|i| i + d.len())) {
                    Some(end) => items.insert(format!("{}{}", prefix, &rest[..end]), None),
                    None => items.insert(name.clone(), Some(data.len())),
                };
            }
            // The marker names the first item of the next page.
            let mut items = items
                .into_iter()
                .skip_while(|(name, _)| params.get("marker").is_some_and(|m| name < m));

            let mut body = String::from("<EnumerationResults><Blobs>");
            for (name, size) in items.by_ref().take(max_results) {
                match size {
                    Some(size) => body.push_str(&format!(
                        "<Blob><Name>{}</Name><Properties>\
                         <Content-Length>{}</Content-Length><Etag>0x{:X}</Etag>\
                         </Properties></Blob>",
                        escape(&name),
                        size,
                        size
                    )),
                    None => body.push_str(&format!(
                        "<BlobPrefix><Name>{}</Name></BlobPrefix>",
                        escape(&name)
                    )),
                }
            }
            body.push_str("</Blobs>");
            if let Some((next, _)) = items.next() {
                body.push_str(&format!("<NextMarker>{}</NextMarker>", escape(&next)));
            }
            body.push_str("</EnumerationResults>");
            testing::xml(StatusCode::OK, body)
        }

        fn commit(&mut self, name: &str, body: &str) -> Response {
            let ids: Vec<&str> = body
                .split("<Latest>")
                .skip(1)
                .filter_map(|part| part.split_once("</Latest>").map(|(id, _)| id))
                .collect();
            let mut data = Vec::new();
            for id in &ids {
                match self.staged.remove(&(name.to_string(), id.to_string())) {
                    Some(block) => data.extend(block),
                    None => return StatusCode::BAD_REQUEST.into_response(),
                }
            }
            self.committed_blocks += ids.len();
            self.blobs.insert(name.to_string(), data);
            StatusCode::CREATED.into_response()
        }
    }

    async fn handle(
        State(container): State<FakeContainer>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("SharedKey acct:"));
        if !authorized {
            return StatusCode::FORBIDDEN.into_response();
        }
        let mut container = container.lock().unwrap();
        let params = testing::query(&uri);
        let path = testing::path(&uri);
        let Some(rest) = path.strip_prefix("acct/backups") else {
            return StatusCode::NOT_FOUND.into_response();
        };
        if rest.is_empty() {
            return match params.get("comp").map(String::as_str) {
                Some("list") => container.list(&params),
                _ => StatusCode::BAD_REQUEST.into_response(),
            };
        }
        let name = rest.trim_start_matches('/').to_string();

        match (method, params.get("comp").map(String::as_str)) {
            (Method::PUT, Some("block")) => {
                let id = params.get("blockid").cloned().unwrap_or_default();
                container.staged.insert((name, id), body.to_vec());
                StatusCode::CREATED.into_response()
            }
            (Method::PUT, Some("blocklist")) => {
                container.commit(&name, &String::from_utf8_lossy(&body))
            }
            (Method::PUT, None) => {
                if headers.get("x-ms-blob-type").is_none() {
                    return StatusCode::BAD_REQUEST.into_response();
                }
                container.blobs.insert(name, body.to_vec());
                StatusCode::CREATED.into_response()
            }
            (Method::HEAD | Method::GET, None) => match container.blobs.get(&name) {
                Some(data) => {
                    let range = testing::range(&headers, "x-ms-range");
                    let (status, data) = testing::ranged(data, range);
                    let etag = format!("0x{:X}", data.len());
                    (status, [("etag", etag)], data).into_response()
                }
                None => StatusCode::NOT_FOUND.into_response(),
            },
            (Method::DELETE, None) => match container.blobs.remove(&name) {
                Some(_) => StatusCode::ACCEPTED.into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            },
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    async fn fake_container(block_threshold: u64) -> (FakeContainer, AzureService) {
        let container = FakeContainer::default();
        let state = container.clone();
        let base = testing::serve(|_| Router::new().fallback(handle).with_state(state)).await;
        let mut config = config();
        config["endpoint"] = json!(format!("{}/acct", base));
        config["block_threshold"] = json!(block_threshold);
        config["block_size"] = json!(1000);
        config["max_retries"] = json!(0);
        let config: AzureConfig = serde_json::from_value(config).unwrap();
        (container, AzureService::new(config).unwrap())
    }

    fn file(path: &str) -> BackupEntry {
        BackupEntry::from_path(path, EntryKind::File).unwrap()
    }

    fn folder(path: &str) -> BackupEntry {
        BackupEntry::from_path(path, EntryKind::Folder).unwrap()
    }

    async fn put(service: &AzureService, path: &str, data: &[u8]) {
        let source = SizedStream::from_bytes(data.to_vec());
        service
            .upload(&file(path), source, None, &CancellationToken::new())
            .await
            .unwrap();
    }

    async fn names(service: &AzureService, parent: &str, pattern: Option<&str>) -> Vec<String> {
        let entries: Vec<BackupEntry> = service
            .find(Some(folder(parent)), pattern.map(NamePattern::new), CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        let mut names: Vec<String> = entries.iter().map(|e| e.name().to_string()).collect();
        names.sort();
        names
    }

    fn config() -> Value {
        json!({
            "account": "acct",
            "access_key": "c3Rvd2FnZS10ZXN0LWtleQ==",
            "container": "backups",
        })
    }

    #[test]
    fn test_config_defaults() {
        let config: AzureConfig = serde_json::from_value(config()).unwrap();
        assert_eq!(config.block_threshold, 64 * 1024 * 1024);
        assert_eq!(config.link_expiry_secs, 604_800);
        assert!(!format!("{:?}", config).contains("c3Rvd2Fn"));
        assert!(create_azure_service(config_value_with("access_key", "%%%")).is_err());
    }

    fn config_value_with(field: &str, value: &str) -> Value {
        let mut config = config();
        config[field] = json!(value);
        config
    }

    #[test]
    fn test_block_size_grows_for_huge_payloads() {
        assert_eq!(block_size_for(8 << 20, 100 << 20), 8 << 20);
        let huge = 1u64 << 40;
        assert!(block_size_for(8 << 20, huge) * MAX_BLOCKS >= huge);
    }

    #[test]
    fn test_page_entries() {
        let xml = r#"<EnumerationResults>
              <Blobs>
                <BlobPrefix><Name>photos/2024/</Name></BlobPrefix>
                <Blob><Name>photos/a.jpg</Name><Properties><Content-Length>5</Content-Length></Properties></Blob>
                <Blob><Name>photos/b.png</Name><Properties><Content-Length>6</Content-Length></Properties></Blob>
                <Blob><Name>photos/</Name><Properties><Content-Length>0</Content-Length></Properties></Blob>
              </Blobs>
            </EnumerationResults>"#;
        let page: EnumerationResults = parse_xml(xml, "List Blobs").unwrap();

        let all = page_entries("photos/", &page, None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].is_folder());
        assert_eq!(all[0].full_path().unwrap(), "photos/2024");

        let pattern = NamePattern::new("*.jpg");
        let jpgs = page_entries("photos/", &page, Some(&pattern)).unwrap();
        assert_eq!(jpgs.len(), 1);
        assert_eq!(jpgs[0].size(), Some(5));
        assert_eq!(jpgs[0].parent().unwrap().name(), "photos");
    }

    #[tokio::test]
    async fn test_unpublish_not_supported() {
        let service = create_azure_service(config()).unwrap();
        let result = service
            .unpublish(&BackupEntry::file("a.txt"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_round_trip_over_http() {
        let (_container, service) = fake_container(default_block_threshold()).await;
        let token = CancellationToken::new();
        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        put(&service, "docs/random.bin", &data).await;
        put(&service, "docs/a.txt", b"alpha").await;
        put(&service, "docs/b.txt", b"beta").await;
        put(&service, "docs/sub/c.txt", b"gamma").await;

        assert_eq!(
            names(&service, "docs", None).await,
            vec!["a.txt", "b.txt", "random.bin", "sub"]
        );
        assert_eq!(names(&service, "docs", Some("*.bin")).await, vec!["random.bin"]);

        let entry = file("docs/random.bin");
        service.fill_info(&entry, &token).await.unwrap();
        assert_eq!(entry.size(), Some(4096));

        let mut out: Vec<u8> = Vec::new();
        service.download(&entry, &mut out, None, None, &token).await.unwrap();
        assert_eq!(out, data);
        let mut tail: Vec<u8> = Vec::new();
        let range = ByteRange::new(4000, None).unwrap();
        service.download(&entry, &mut tail, Some(range), None, &token).await.unwrap();
        assert_eq!(tail, &data[4000..]);

        service.delete(&entry, &token).await.unwrap();
        assert!(matches!(service.delete(&entry, &token).await, Err(Error::NotFound(_))));
        assert!(matches!(service.fill_info(&entry, &token).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_block_upload() {
        let (container, service) = fake_container(1).await;
        let data: Vec<u8> = (0..3500u32).map(|i| (i % 253) as u8).collect();
        let sent = Arc::new(AtomicU64::new(0));
        let seen = sent.clone();
        let progress: ProgressCallback = Arc::new(move |n| seen.store(n, Ordering::SeqCst));
        service
            .upload(
                &file("big/archive.bin"),
                SizedStream::from_bytes(data.clone()),
                Some(progress),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 3500);
        let container = container.lock().unwrap();
        assert_eq!(container.committed_blocks, 4);
        assert!(container.staged.is_empty());
        assert_eq!(container.blobs["big/archive.bin"], data);
    }

    #[tokio::test]
    async fn test_full_path_identity() {
        let (container, service) = fake_container(default_block_threshold()).await;
        let token = CancellationToken::new();
        put(&service, "folderA/data.txt", &[1u8; 100]).await;
        put(&service, "folderB/data.txt", &[2u8; 200]).await;
        put(&service, "folderB/nested/one.txt", b"one").await;
        put(&service, "folderB/nested/two.txt", b"two").await;

        let entry = file("folderA/data.txt");
        service.fill_info(&entry, &token).await.unwrap();
        assert_eq!(entry.size(), Some(100));
        service.delete(&entry, &token).await.unwrap();
        assert_eq!(container.lock().unwrap().blobs["folderB/data.txt"].len(), 200);

        service.delete(&folder("folderB"), &token).await.unwrap();
        assert!(container.lock().unwrap().blobs.is_empty());
        assert!(matches!(
            service.fill_info(&folder("folderB"), &token).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_returns_sas_url() {
        let (_container, service) = fake_container(default_block_threshold()).await;
        let token = CancellationToken::new();
        put(&service, "shared/report.pdf", b"%PDF").await;

        let url = service
            .publish(&file("shared/report.pdf"), Some(Duration::from_secs(3600)), &token)
            .await
            .unwrap();
        assert!(url.contains("/acct/backups/shared/report.pdf?"));
        assert!(url.contains("sp=r") && url.contains("sig="));

        assert!(matches!(
            service.publish(&file("shared/missing.pdf"), None, &token).await,
            Err(Error::NotFound(_))
        ));
    }
}
