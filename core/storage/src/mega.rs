//! MEGA implementation of [`BackupService`].
//!
//! Wraps a [`MegaClient`] that logs in lazily on first use. Paths resolve
//! against the client's node snapshot; when several nodes share a path the
//! newest one is the visible one, and mutations clean up the others.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tracing::{debug, info};

use stowage_common::pattern::matches_pattern;
use stowage_common::{
    BackupEntry, ByteRange, CancellationToken, EntryInfo, EntryKind, Error, NamePattern,
    PollConfig, ProgressCallback, Result, RetryConfig, SizedStream,
};
use stowage_mega::{ApiTransport, ClientOptions, MegaClient, Node, NodeTree};

use crate::s3::service::{default_max_retries, default_timeout_secs};
use crate::service::{
    entry_at, failed_stream, join_path, listing_path, once_listing, BackupService, EntryStream,
    ProviderKind,
};

/// MEGA provider configuration.
#[derive(Clone, Deserialize)]
pub struct MegaConfig {
    pub email: String,
    pub password: String,
    /// API endpoint override.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Host used when formatting public links.
    #[serde(default)]
    pub link_base: Option<String>,
    /// Budget for confirming that a revoked link stopped resolving.
    #[serde(default = "default_unpublish_poll")]
    pub unpublish_poll: PollConfig,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl std::fmt::Debug for MegaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegaConfig")
            .field("email", &self.email)
            .field("api_url", &self.api_url)
            .field("link_base", &self.link_base)
            .finish_non_exhaustive()
    }
}

fn default_unpublish_poll() -> PollConfig {
    PollConfig::fixed(10, Duration::from_secs(2))
}

impl MegaConfig {
    /// Client settings derived from this configuration.
    pub fn client_options(&self) -> ClientOptions {
        let defaults = ClientOptions::default();
        ClientOptions {
            api_url: self.api_url.clone().unwrap_or(defaults.api_url),
            link_base: self.link_base.clone().unwrap_or(defaults.link_base),
            timeout: Duration::from_secs(self.timeout_secs),
            retry: RetryConfig::new(self.max_retries),
            unpublish_poll: self.unpublish_poll.to_retry_config(),
        }
    }
}

/// Whether operations may log in on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPolicy {
    Lazy,
    Suspended,
}

fn node_info(node: &Node) -> EntryInfo {
    EntryInfo {
        size: (!node.is_folder()).then_some(node.size),
        modified: node.created,
        remote_id: Some(node.handle.clone()),
    }
}

fn node_kind(node: &Node) -> EntryKind {
    if node.is_folder() {
        EntryKind::Folder
    } else {
        EntryKind::File
    }
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

fn resolve<'t>(tree: &'t NodeTree, path: &str) -> Result<&'t Node> {
    tree.by_path(path)
        .ok_or_else(|| Error::NotFound(format!("Nothing exists at '{}'", path)))
}

fn resolve_folder<'t>(tree: &'t NodeTree, path: &str) -> Result<&'t Node> {
    let node = resolve(tree, path)?;
    if !node.is_folder() {
        return Err(Error::InvalidInput(format!("'{}' is not a folder", path)));
    }
    Ok(node)
}

/// Every node stored at `path`, the visible one included.
fn versions_at<'t>(tree: &'t NodeTree, path: &str) -> Vec<&'t Node> {
    let (parent, name) = split_path(path);
    let Some(parent) = tree.by_path(parent) else {
        return Vec::new();
    };
    let Some(visible) = tree.by_path(path) else {
        return Vec::new();
    };
    let kind = visible.kind;
    tree.children(&parent.handle)
        .filter(|node| node.name == name && node.kind == kind)
        .collect()
}

/// MEGA backup service.
///
/// Folders are real. Uploading to an existing path stores the new file
/// before removing the old one, so a failed upload never loses data.
/// Public links cannot expire; `unpublish` waits until the link stops
/// resolving.
pub struct MegaService {
    client: MegaClient,
    email: String,
    password: String,
    policy: Mutex<SessionPolicy>,
}

impl MegaService {
    /// Create a service talking to the real API.
    pub fn new(config: MegaConfig) -> Result<Self> {
        Self::check(&config)?;
        let client = MegaClient::new(config.client_options())?;
        Ok(Self::from_client(client, config))
    }

    /// Create a service over a custom transport.
    pub fn with_transport(transport: Arc<dyn ApiTransport>, config: MegaConfig) -> Result<Self> {
        Self::check(&config)?;
        let client = MegaClient::with_transport(transport, config.client_options());
        Ok(Self::from_client(client, config))
    }

    fn check(config: &MegaConfig) -> Result<()> {
        if config.email.is_empty() || config.password.is_empty() {
            return Err(Error::InvalidInput(
                "MEGA email and password are required".to_string(),
            ));
        }
        Ok(())
    }

    fn from_client(client: MegaClient, config: MegaConfig) -> Self {
        Self {
            client,
            email: config.email,
            password: config.password,
            policy: Mutex::new(SessionPolicy::Lazy),
        }
    }

    /// Underlying protocol client.
    pub fn client(&self) -> &MegaClient {
        &self.client
    }

    /// Log in now and re-enable logging in on demand.
    pub async fn login(&self, token: &CancellationToken) -> Result<()> {
        let mut policy = self.policy.lock().await;
        if !self.client.is_logged_in().await {
            self.client.login(&self.email, &self.password, token).await?;
        }
        *policy = SessionPolicy::Lazy;
        Ok(())
    }

    /// Log out. Later operations fail with `InvalidState` until
    /// [`MegaService::login`] is called.
    pub async fn logout(&self, token: &CancellationToken) -> Result<()> {
        let mut policy = self.policy.lock().await;
        self.client.logout(token).await?;
        *policy = SessionPolicy::Suspended;
        Ok(())
    }

    async fn session(&self, token: &CancellationToken) -> Result<()> {
        let policy = self.policy.lock().await;
        if self.client.is_logged_in().await {
            return Ok(());
        }
        match *policy {
            SessionPolicy::Suspended => Err(Error::InvalidState(
                "Logged out of MEGA; log in again first".to_string(),
            )),
            SessionPolicy::Lazy => {
                debug!("Logging in to MEGA on first use");
                self.client.login(&self.email, &self.password, token).await
            }
        }
    }

    async fn tree(&self, token: &CancellationToken) -> Result<Arc<NodeTree>> {
        self.session(token).await?;
        self.client.nodes(token).await
    }

    async fn list(
        &self,
        path: &str,
        pattern: Option<&NamePattern>,
        token: &CancellationToken,
    ) -> Result<Vec<BackupEntry>> {
        let tree = self.tree(token).await?;
        let folder = resolve_folder(&tree, path)?;

        let mut entries = Vec::new();
        for node in tree.children(&folder.handle) {
            if !matches_pattern(pattern, &node.name) {
                continue;
            }
            let child = join_path(path, &node.name);
            // Superseded duplicates stay hidden.
            if tree.by_path(&child).map(|visible| &visible.handle) != Some(&node.handle) {
                continue;
            }
            entries.push(entry_at(&child, node_kind(node), node_info(node))?);
        }
        Ok(entries)
    }

    async fn delete_all(&self, nodes: &[&Node], token: &CancellationToken) -> Result<()> {
        for node in nodes {
            match self.client.delete(&node.handle, token).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackupService for MegaService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mega
    }

    fn can_folders(&self) -> bool {
        true
    }

    async fn create_folder(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            let tree = self.tree(token).await?;
            let (parent, name) = split_path(&path);
            let parent = resolve_folder(&tree, parent)?;
            self.client.create_folder(&parent.handle, name, token).await?;
            Ok(())
        }
        .await;
        result.map_err(|e| e.at("mega", &path))
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
        once_listing(async move {
            self.list(&path, pattern.as_ref(), &token)
                .await
                .map_err(|e| e.at("mega", &path))
        })
    }

    async fn fill_info(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<EntryInfo> = async {
            let tree = self.tree(token).await?;
            Ok(node_info(resolve(&tree, &path)?))
        }
        .await;
        entry.set_info(result.map_err(|e| e.at("mega", &path))?);
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
        let result: Result<u64> = async {
            let tree = self.tree(token).await?;
            let (parent, name) = split_path(&path);
            let parent = resolve_folder(&tree, parent)?.handle.clone();
            let previous = versions_at(&tree, &path);
            if previous.iter().any(|node| node.is_folder()) {
                return Err(Error::AlreadyExists(
                    "A folder exists at this path".to_string(),
                ));
            }

            let node = self
                .client
                .upload(&parent, name, source, progress, token)
                .await?;
            if !previous.is_empty() {
                debug!("Replacing {} older version(s) of {}", previous.len(), path);
                self.delete_all(&previous, token).await?;
            }
            Ok(node.size)
        }
        .await;
        let size = result.map_err(|e| e.at("mega", &path))?;
        info!("Uploaded {} ({} bytes)", path, size);
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
            let tree = self.tree(token).await?;
            let node = resolve(&tree, &path)?;
            if node.is_folder() {
                return Err(Error::InvalidInput("Cannot download a folder".to_string()));
            }
            self.client
                .download(&node.handle, dest, range, progress, token)
                .await
        }
        .await;
        result.map_err(|e| e.at("mega", &path))
    }

    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            let tree = self.tree(token).await?;
            resolve(&tree, &path)?;
            self.delete_all(&versions_at(&tree, &path), token).await
        }
        .await;
        result.map_err(|e| e.at("mega", &path))?;
        info!("Deleted {}", path);
        Ok(())
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
                return Err(Error::NotSupported("MEGA links cannot expire".to_string()));
            }
            let tree = self.tree(token).await?;
            let handle = resolve(&tree, &path)?.handle.clone();
            self.client.export_link(&handle, token).await
        }
        .await;
        let url = result.map_err(|e| e.at("mega", &path))?;
        info!("Published {}", path);
        Ok(url)
    }

    async fn unpublish(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let result: Result<()> = async {
            let tree = self.tree(token).await?;
            let handle = resolve(&tree, &path)?.handle.clone();
            self.client.revoke_link(&handle, token).await
        }
        .await;
        result.map_err(|e| e.at("mega", &path))
    }
}

/// Create a MEGA service from a JSON configuration.
pub fn create_mega_service(config: Value) -> Result<Arc<dyn BackupService>> {
    let config: MegaConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid MEGA config: {}", e)))?;
    Ok(Arc::new(MegaService::new(config)?))
}
