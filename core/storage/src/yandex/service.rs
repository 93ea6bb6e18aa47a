//! Yandex Disk implementation of [`BackupService`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use stowage_common::pattern::matches_pattern;
use stowage_common::transfer::{with_progress, write_stream};
use stowage_common::{
    poll_until, BackupEntry, ByteRange, CancellationToken, EntryInfo, EntryKind, Error,
    NamePattern, PollConfig, PollStatus, ProgressCallback, ProgressTracker, Result, RetryConfig,
    SizedStream,
};

use super::client::{OperationStatus, Resource, ResourceType, YandexClient};
use crate::s3::service::{default_max_retries, default_timeout_secs};
use crate::service::{
    entry_at, failed_stream, join_path, listing_path, paginate, BackupService, EntryStream,
    ProviderKind,
};

/// Yandex Disk provider configuration.
#[derive(Clone, Deserialize)]
pub struct YandexConfig {
    /// OAuth token with disk read/write scope.
    pub oauth_token: String,
    /// API root, for tests against a local fake.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Entries fetched per listing request.
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Budget for waiting on publish and unpublish to become visible.
    #[serde(default = "default_publish_poll")]
    pub publish_poll: PollConfig,
    /// Budget for waiting on asynchronous deletes.
    #[serde(default = "default_operation_poll")]
    pub operation_poll: PollConfig,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl std::fmt::Debug for YandexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YandexConfig")
            .field("api_url", &self.api_url)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

fn default_page_size() -> u64 {
    100
}

fn default_publish_poll() -> PollConfig {
    PollConfig {
        max_attempts: 10,
        interval_ms: 500,
        backoff: 2.0,
        max_interval_ms: Some(5_000),
    }
}

fn default_operation_poll() -> PollConfig {
    PollConfig {
        max_attempts: 30,
        interval_ms: 1_000,
        backoff: 1.5,
        max_interval_ms: Some(10_000),
    }
}

fn resource_info(resource: &Resource) -> EntryInfo {
    EntryInfo {
        size: resource.size,
        modified: resource.modified,
        remote_id: resource.resource_id.clone(),
    }
}

fn resource_kind(resource: &Resource) -> EntryKind {
    match resource.kind {
        ResourceType::Dir => EntryKind::Folder,
        ResourceType::File => EntryKind::File,
    }
}

/// Yandex Disk backup service.
///
/// Folders are real and paths map directly onto disk paths. Publication is
/// eventually consistent on the API side: `publish` waits until the public
/// URL is reported, `unpublish` until the public key stops resolving.
pub struct YandexService {
    client: YandexClient,
    page_size: u64,
    publish_poll: RetryConfig,
    operation_poll: RetryConfig,
}

impl YandexService {
    /// Create a service from its configuration.
    pub fn new(config: YandexConfig) -> Result<Self> {
        if config.oauth_token.is_empty() {
            return Err(Error::InvalidInput("Yandex OAuth token is empty".to_string()));
        }
        if config.page_size == 0 {
            return Err(Error::InvalidInput("Yandex page size must be positive".to_string()));
        }
        let client = YandexClient::new(
            config.oauth_token,
            config.api_url.as_deref(),
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            client,
            page_size: config.page_size,
            publish_poll: config.publish_poll.to_retry_config(),
            operation_poll: config.operation_poll.to_retry_config(),
        })
    }

    async fn wait_for_operation(&self, href: &str, token: &CancellationToken) -> Result<()> {
        poll_until(&self.operation_poll, token, "Yandex operation", || async move {
            match self.client.operation_status(href, token).await? {
                OperationStatus::Success => Ok(PollStatus::Ready(())),
                OperationStatus::InProgress => Ok(PollStatus::Pending),
                OperationStatus::Failed => Err(Error::InvalidState(format!(
                    "Operation {} failed",
                    href
                ))),
            }
        })
        .await
    }

    /// Public key of the resource, if it is currently published.
    async fn public_key(&self, path: &str, token: &CancellationToken) -> Result<Option<String>> {
        let resource = self.client.resource(path, 0, 0, token).await?;
        Ok(resource.public_key)
    }
}

#[async_trait]
impl BackupService for YandexService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YandexDisk
    }

    fn can_folders(&self) -> bool {
        true
    }

    async fn create_folder(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        self.client
            .create_folder(&path, token)
            .await
            .map_err(|e| e.at("yandex", &path))?;
        debug!("Created folder {}", path);
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

        paginate(move |offset: Option<u64>| {
            let path = path.clone();
            let pattern = pattern.clone();
            let token = token.clone();
            async move {
                let folder = self
                    .client
                    .resource(&path, self.page_size, offset.unwrap_or(0), &token)
                    .await
                    .map_err(|e| e.at("yandex", &path))?;
                let Some(list) = folder.embedded else {
                    return Err(Error::InvalidInput("Not a folder".to_string()).at("yandex", &path));
                };

                let mut entries = Vec::new();
                for item in &list.items {
                    if !matches_pattern(pattern.as_ref(), &item.name) {
                        continue;
                    }
                    let child = join_path(&path, &item.name);
                    entries.push(entry_at(&child, resource_kind(item), resource_info(item))?);
                }
                Ok((entries, list.next_offset()))
            }
        })
    }

    async fn fill_info(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let resource = self
            .client
            .resource(&path, 0, 0, token)
            .await
            .map_err(|e| e.at("yandex", &path))?;
        entry.set_info(resource_info(&resource));
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
        let result: Result<()> = async {
            let link = self.client.upload_link(&path, token).await?;
            let body = with_progress(source.into_checked_stream(), progress);
            self.client.upload_to(&link.href, body, length, token).await
        }
        .await;
        result.map_err(|e| e.at("yandex", &path))?;
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
            let link = self.client.download_link(&path, token).await?;
            let stream = self.client.download_from(&link.href, range, token).await?;
            let mut tracker = ProgressTracker::new(progress);
            write_stream(stream, dest, &mut tracker, token).await
        }
        .await;
        result.map_err(|e| e.at("yandex", &path))
    }

    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            if let Some(operation) = self.client.delete(&path, token).await? {
                debug!("Delete of {} runs asynchronously", path);
                self.wait_for_operation(&operation.href, token).await?;
            }
            Ok(())
        }
        .await;
        result.map_err(|e| e.at("yandex", &path))
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
                    "Yandex Disk links cannot expire".to_string(),
                ));
            }
            self.client.publish(&path, token).await?;
            poll_until(&self.publish_poll, token, "Yandex publication", || {
                let path = path.as_str();
                async move {
                    let resource = self.client.resource(path, 0, 0, token).await?;
                    Ok(match resource.public_url {
                        Some(url) => PollStatus::Ready(url),
                        None => PollStatus::Pending,
                    })
                }
            })
            .await
        }
        .await;
        let url = result.map_err(|e| e.at("yandex", &path))?;
        info!("Published {}", path);
        Ok(url)
    }

    async fn unpublish(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            let Some(public_key) = self.public_key(&path, token).await? else {
                debug!("{} is not published", path);
                return Ok(());
            };
            self.client.unpublish(&path, token).await?;
            poll_until(&self.publish_poll, token, "Yandex unpublication", || {
                let public_key = public_key.as_str();
                async move {
                    match self.client.public_resource(public_key, token).await {
                        Err(Error::NotFound(_)) => Ok(PollStatus::Ready(())),
                        Err(err) => Err(err),
                        Ok(_) => Ok(PollStatus::Pending),
                    }
                }
            })
            .await
        }
        .await;
        result.map_err(|e| e.at("yandex", &path))?;
        info!("Unpublished {}", path);
        Ok(())
    }
}

/// Create a Yandex Disk service from a JSON configuration.
pub fn create_yandex_service(config: Value) -> Result<Arc<dyn BackupService>> {
    let config: YandexConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid Yandex config: {}", e)))?;
    Ok(Arc::new(YandexService::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, json as reply};
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::Router;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Just enough of the Yandex Disk API to drive [`YandexService`].
    #[derive(Default)]
    struct Disk {
        base: String,
        folders: BTreeSet<String>,
        files: BTreeMap<String, Vec<u8>>,
        /// Public key per published path.
        keys: HashMap<String, String>,
        /// Resource reads left before a new publication shows up.
        publishing: HashMap<String, u32>,
        /// Public reads left before a revoked key stops resolving.
        revoking: HashMap<String, u32>,
        operations: HashMap<String, u32>,
        publish_lag: u32,
        unpublish_lag: u32,
        delete_polls: u32,
        ignore_range: bool,
        next_id: u64,
    }

    type FakeDisk = Arc<Mutex<Disk>>;

    fn parent_of(path: &str) -> &str {
        path.rsplit_once('/').map_or("", |(parent, _)| parent)
    }

    fn name_of(path: &str) -> &str {
        path.rsplit_once('/').map_or(path, |(_, name)| name)
    }

    fn error(status: StatusCode, code: &str) -> Response {
        reply(status, json!({"error": code, "description": code}))
    }

    impl Disk {
        fn is_folder(&self, path: &str) -> bool {
            path.is_empty() || self.folders.contains(path)
        }

        fn exists(&self, path: &str) -> bool {
            self.is_folder(path) || self.files.contains_key(path)
        }

        fn link(&self, route: &str, path: &str) -> Value {
            let url = url::Url::parse_with_params(
                &format!("{}{}", self.base, route),
                &[("path", path)],
            )
            .unwrap();
            json!({"href": url.as_str(), "method": "GET"})
        }

        fn describe(&mut self, path: &str) -> Value {
            let mut resource = if self.is_folder(path) {
                json!({"name": name_of(path), "path": format!("disk:/{}", path), "type": "dir"})
            } else {
                json!({
                    "name": name_of(path),
                    "path": format!("disk:/{}", path),
                    "type": "file",
                    "size": self.files[path].len(),
                    "modified": "2024-03-01T12:00:00+00:00",
                    "resource_id": format!("id:{}", path),
                })
            };
            let visible = match self.publishing.get_mut(path) {
                Some(0) | None => true,
                Some(left) => {
                    *left -= 1;
                    false
                }
            };
            if let (true, Some(key)) = (visible, self.keys.get(path)) {
                resource["public_key"] = json!(key);
                resource["public_url"] = json!(format!("https://yadi.sk/d/{}", key));
            }
            resource
        }

        fn children(&self, path: &str) -> Vec<String> {
            let folders = self.folders.iter().filter(|f| parent_of(f) == path);
            let files = self.files.keys().filter(|f| parent_of(f) == path);
            folders.chain(files).cloned().collect()
        }

        fn resource(&mut self, params: &HashMap<String, String>, path: &str) -> Response {
            if !self.exists(path) {
                return error(StatusCode::NOT_FOUND, "DiskNotFoundError");
            }
            let mut resource = self.describe(path);
            if self.is_folder(path) {
                let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(20);
                let offset: usize = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
                let children = self.children(path);
                let items: Vec<Value> = children
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .map(|child| self.describe(child))
                    .collect();
                resource["_embedded"] = json!({
                    "items": items,
                    "offset": offset,
                    "limit": limit,
                    "total": children.len(),
                });
            }
            reply(StatusCode::OK, resource)
        }

        fn remove(&mut self, path: &str) {
            let below = format!("{}/", path);
            self.folders.retain(|f| f != path && !f.starts_with(&below));
            self.files.retain(|f, _| f != path && !f.starts_with(&below));
            self.keys.retain(|p, _| p != path && !p.starts_with(&below));
        }

        fn public(&mut self, key: &str) -> Response {
            if let Some(path) = self.keys.iter().find(|(_, k)| *k == key).map(|(p, _)| p.clone()) {
                return reply(StatusCode::OK, self.describe(&path));
            }
            match self.revoking.get_mut(key) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    reply(StatusCode::OK, json!({"name": "x", "path": "/", "type": "file"}))
                }
                _ => error(StatusCode::NOT_FOUND, "DiskNotFoundError"),
            }
        }
    }

    async fn handle(
        State(disk): State<FakeDisk>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let mut disk = disk.lock().unwrap();
        let params = testing::query(&uri);
        let path = params
            .get("path")
            .map(|p| p.trim_start_matches("disk:/").to_string())
            .unwrap_or_default();

        match (method, uri.path()) {
            (Method::GET, "/resources") => disk.resource(&params, &path),
            (Method::PUT, "/resources") => {
                if disk.exists(&path) {
                    error(StatusCode::CONFLICT, "DiskPathPointsToExistentDirectoryError")
                } else if !disk.is_folder(parent_of(&path)) {
                    error(StatusCode::CONFLICT, "DiskPathDoesntExistsError")
                } else {
                    disk.folders.insert(path.clone());
                    let link = disk.link("/resources", &path);
                    reply(StatusCode::CREATED, link)
                }
            }
            (Method::DELETE, "/resources") => {
                if !disk.exists(&path) {
                    return error(StatusCode::NOT_FOUND, "DiskNotFoundError");
                }
                let folder = disk.is_folder(&path);
                disk.remove(&path);
                if folder && disk.delete_polls > 0 {
                    disk.next_id += 1;
                    let id = disk.next_id.to_string();
                    let polls = disk.delete_polls;
                    disk.operations.insert(id.clone(), polls);
                    let href = format!("{}/operations/{}", disk.base, id);
                    return reply(StatusCode::ACCEPTED, json!({"href": href, "method": "GET"}));
                }
                StatusCode::NO_CONTENT.into_response()
            }
            (Method::GET, "/resources/upload") => {
                if !disk.is_folder(parent_of(&path)) {
                    return error(StatusCode::CONFLICT, "DiskPathDoesntExistsError");
                }
                let link = disk.link("/_upload", &path);
                reply(StatusCode::OK, link)
            }
            (Method::PUT, "/_upload") => {
                disk.files.insert(path, body.to_vec());
                StatusCode::CREATED.into_response()
            }
            (Method::GET, "/resources/download") => {
                if !disk.files.contains_key(&path) {
                    return error(StatusCode::NOT_FOUND, "DiskNotFoundError");
                }
                let link = disk.link("/_download", &path);
                reply(StatusCode::OK, link)
            }
            (Method::GET, "/_download") => {
                let range = testing::range(&headers, "range").filter(|_| !disk.ignore_range);
                let (status, data) = testing::ranged(&disk.files[&path], range);
                (status, data).into_response()
            }
            (Method::PUT, "/resources/publish") => {
                if !disk.exists(&path) {
                    return error(StatusCode::NOT_FOUND, "DiskNotFoundError");
                }
                if !disk.keys.contains_key(&path) {
                    disk.next_id += 1;
                    let key = format!("pk{}", disk.next_id);
                    disk.keys.insert(path.clone(), key);
                    let lag = disk.publish_lag;
                    disk.publishing.insert(path.clone(), lag);
                }
                let link = disk.link("/resources", &path);
                reply(StatusCode::OK, link)
            }
            (Method::PUT, "/resources/unpublish") => {
                if let Some(key) = disk.keys.remove(&path) {
                    let lag = disk.unpublish_lag;
                    disk.revoking.insert(key, lag);
                }
                let link = disk.link("/resources", &path);
                reply(StatusCode::OK, link)
            }
            (Method::GET, "/public/resources") => {
                let key = params.get("public_key").cloned().unwrap_or_default();
                disk.public(&key)
            }
            (Method::GET, route) if route.starts_with("/operations/") => {
                let id = route.trim_start_matches("/operations/");
                let status = match disk.operations.get_mut(id) {
                    Some(0) => "success",
                    Some(left) => {
                        *left -= 1;
                        "in-progress"
                    }
                    None => return error(StatusCode::NOT_FOUND, "DiskNotFoundError"),
                };
                reply(StatusCode::OK, json!({"status": status}))
            }
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        }
    }

    async fn fake_disk() -> (FakeDisk, YandexService) {
        let disk = FakeDisk::default();
        let state = disk.clone();
        let base = testing::serve(|base| {
            state.lock().unwrap().base = base.to_string();
            Router::new().fallback(handle).with_state(state.clone())
        })
        .await;
        let config: YandexConfig = serde_json::from_value(json!({
            "oauth_token": "test-token",
            "api_url": base,
            "page_size": 2,
            "publish_poll": {"max_attempts": 5, "interval_ms": 1},
            "operation_poll": {"max_attempts": 5, "interval_ms": 1},
            "max_retries": 0,
        }))
        .unwrap();
        (disk, YandexService::new(config).unwrap())
    }

    fn file(path: &str) -> BackupEntry {
        BackupEntry::from_path(path, EntryKind::File).unwrap()
    }

    fn folder(path: &str) -> BackupEntry {
        BackupEntry::from_path(path, EntryKind::Folder).unwrap()
    }

    async fn names(service: &YandexService, parent: &str, pattern: Option<&str>) -> Vec<String> {
        let entries: Vec<BackupEntry> = service
            .find(Some(folder(parent)), pattern.map(NamePattern::new), CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        entries.iter().map(|e| e.name().to_string()).collect()
    }

    async fn put(service: &YandexService, path: &str, data: &[u8]) {
        let source = SizedStream::from_bytes(data.to_vec());
        service
            .upload(&file(path), source, None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[test]
    fn test_config_defaults_and_redaction() {
        let config: YandexConfig =
            serde_json::from_value(json!({"oauth_token": "y0_secret"})).unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.publish_poll.max_attempts, 10);
        assert!(!format!("{:?}", config).contains("y0_secret"));
    }

    #[test]
    fn test_rejects_empty_token() {
        assert!(matches!(
            create_yandex_service(json!({"oauth_token": ""})),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_resource_mapping() {
        let resource: Resource = serde_json::from_value(json!({
            "name": "a.txt",
            "path": "disk:/docs/a.txt",
            "type": "file",
            "size": 12,
            "resource_id": "42:abc",
        }))
        .unwrap();
        assert_eq!(resource_kind(&resource), EntryKind::File);
        let info = resource_info(&resource);
        assert_eq!(info.size, Some(12));
        assert_eq!(info.remote_id.as_deref(), Some("42:abc"));
    }

    #[tokio::test]
    async fn test_expiring_links_not_supported() {
        let service = create_yandex_service(json!({"oauth_token": "t"})).unwrap();
        let result = service
            .publish(
                &BackupEntry::file("a.txt"),
                Some(Duration::from_secs(60)),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_round_trip_over_http() {
        let (_disk, service) = fake_disk().await;
        let token = CancellationToken::new();
        service.create_folder(&folder("docs"), &token).await.unwrap();
        assert!(matches!(
            service.create_folder(&folder("docs"), &token).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            service.create_folder(&folder("missing/child"), &token).await,
            Err(Error::NotFound(_))
        ));

        let data: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        let sent = Arc::new(AtomicU64::new(0));
        let seen = sent.clone();
        let progress: ProgressCallback = Arc::new(move |n| seen.store(n, Ordering::SeqCst));
        let source = SizedStream::from_bytes(data.clone());
        service
            .upload(&file("docs/random.bin"), source, Some(progress), &token)
            .await
            .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 4096);
        put(&service, "docs/a.txt", b"alpha").await;
        put(&service, "docs/b.txt", b"beta").await;

        // Three children over pages of two.
        let mut listed = names(&service, "docs", None).await;
        listed.sort();
        assert_eq!(listed, vec!["a.txt", "b.txt", "random.bin"]);
        assert_eq!(names(&service, "docs", Some("*.txt")).await.len(), 2);

        let entry = file("docs/random.bin");
        service.fill_info(&entry, &token).await.unwrap();
        assert_eq!(entry.size(), Some(4096));

        let mut out: Vec<u8> = Vec::new();
        service.download(&entry, &mut out, None, None, &token).await.unwrap();
        assert_eq!(out, data);
        let mut part: Vec<u8> = Vec::new();
        let range = ByteRange::new(10, Some(19)).unwrap();
        service.download(&entry, &mut part, Some(range), None, &token).await.unwrap();
        assert_eq!(part, &data[10..20]);

        service.delete(&entry, &token).await.unwrap();
        assert!(!names(&service, "docs", None).await.contains(&"random.bin".to_string()));
        assert!(matches!(
            service.fill_info(&file("docs/random.bin"), &token).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_full_path_identity() {
        let (disk, service) = fake_disk().await;
        let token = CancellationToken::new();
        service.create_folder(&folder("folderA"), &token).await.unwrap();
        service.create_folder(&folder("folderB"), &token).await.unwrap();
        put(&service, "folderA/data.txt", &[0u8; 100]).await;
        put(&service, "folderB/data.txt", &[0u8; 200]).await;

        let entry = file("folderA/data.txt");
        service.fill_info(&entry, &token).await.unwrap();
        assert_eq!(entry.size(), Some(100));

        service.delete(&entry, &token).await.unwrap();
        let disk = disk.lock().unwrap();
        assert!(!disk.files.contains_key("folderA/data.txt"));
        assert_eq!(disk.files["folderB/data.txt"].len(), 200);
    }

    #[tokio::test]
    async fn test_async_delete_is_polled() {
        let (disk, service) = fake_disk().await;
        let token = CancellationToken::new();
        service.create_folder(&folder("old"), &token).await.unwrap();
        put(&service, "old/a.bin", b"a").await;
        disk.lock().unwrap().delete_polls = 2;

        service.delete(&folder("old"), &token).await.unwrap();
        assert!(disk.lock().unwrap().files.is_empty());

        disk.lock().unwrap().delete_polls = 50;
        service.create_folder(&folder("slow"), &token).await.unwrap();
        assert!(matches!(
            service.delete(&folder("slow"), &token).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_then_unpublish_is_confirmed() {
        let (disk, service) = fake_disk().await;
        let token = CancellationToken::new();
        put(&service, "shared.txt", b"hello").await;
        {
            let mut disk = disk.lock().unwrap();
            disk.publish_lag = 2;
            disk.unpublish_lag = 2;
        }

        let entry = file("shared.txt");
        let url = service.publish(&entry, None, &token).await.unwrap();
        assert!(url.starts_with("https://yadi.sk/d/"));
        let key = disk.lock().unwrap().keys["shared.txt"].clone();
        assert!(service.client.public_resource(&key, &token).await.is_ok());

        service.unpublish(&entry, &token).await.unwrap();
        assert!(matches!(
            service.client.public_resource(&key, &token).await,
            Err(Error::NotFound(_))
        ));
        // Already private.
        service.unpublish(&entry, &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_lingering_link_times_out() {
        let (disk, service) = fake_disk().await;
        let token = CancellationToken::new();
        put(&service, "shared.txt", b"hello").await;
        let entry = file("shared.txt");
        service.publish(&entry, None, &token).await.unwrap();

        disk.lock().unwrap().unpublish_lag = 100;
        assert!(matches!(
            service.unpublish(&entry, &token).await,
            Err(Error::Timeout(_))
        ));

        disk.lock().unwrap().publish_lag = 100;
        put(&service, "late.txt", b"late").await;
        assert!(matches!(
            service.publish(&file("late.txt"), None, &token).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_ignored_range_not_supported() {
        let (disk, service) = fake_disk().await;
        put(&service, "a.bin", b"0123456789").await;
        disk.lock().unwrap().ignore_range = true;

        let range = ByteRange::new(2, Some(4)).unwrap();
        let mut out: Vec<u8> = Vec::new();
        let token = CancellationToken::new();
        let result = service
            .download(&file("a.bin"), &mut out, Some(range), None, &token)
            .await;
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }
}
