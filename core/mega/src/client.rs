//! MEGA client: session lifecycle, node operations and transfers.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use stowage_common::{
    poll_until, ByteRange, CancellationToken, Error, PollStatus, ProgressCallback, Result,
    RetryConfig, SizedStream,
};
use stowage_crypto::{
    base64url_decode, base64url_encode, decrypt_attributes, encrypt_attributes, wrap_node_key,
    FileKey, FolderKey, NodeAttributes, NodeKey,
};

use crate::api::ApiClient;
use crate::links::{LinkKind, PublicLink, DEFAULT_LINK_BASE};
use crate::nodes::{Node, NodeTree, RawNode, RawPublicHandle};
use crate::session::{self, ActiveSession, SessionState, SessionStatus};
use crate::transfer;
use crate::transport::{ApiTransport, HttpTransport, DEFAULT_API_URL};

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// API endpoint.
    pub api_url: String,
    /// Host used when formatting public links.
    pub link_base: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    /// Retry budget for rate-limited or failed requests.
    pub retry: RetryConfig,
    /// Budget for confirming that a revoked link stopped resolving.
    pub unpublish_poll: RetryConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            link_base: DEFAULT_LINK_BASE.to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
            unpublish_poll: RetryConfig::fixed(10, Duration::from_secs(2)),
        }
    }
}

/// Metadata of a file reached through a public link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicFile {
    pub handle: String,
    pub name: String,
    pub size: u64,
}

/// Resets a half-finished login if the login future is dropped.
struct LoginGuard<'a> {
    state: &'a RwLock<SessionState>,
    armed: bool,
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.state.try_write() {
            if matches!(*state, SessionState::LoggingIn) {
                *state = SessionState::LoggedOut;
            }
        }
    }
}

/// Client for one MEGA account.
///
/// Node and transfer calls hold the session read lock for their whole
/// duration; login and logout take the write lock, so logout waits for
/// in-flight transfers to finish.
pub struct MegaClient {
    api: ApiClient,
    session: RwLock<SessionState>,
    cache: Mutex<Option<Arc<NodeTree>>>,
    link_base: String,
    unpublish_poll: RetryConfig,
}

impl MegaClient {
    /// Create a client talking to the real service.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let transport = HttpTransport::new(options.api_url.clone(), options.timeout)?;
        Ok(Self::with_transport(Arc::new(transport), options))
    }

    /// Create a client over a custom transport.
    pub fn with_transport(transport: Arc<dyn ApiTransport>, options: ClientOptions) -> Self {
        Self {
            api: ApiClient::new(transport, options.retry),
            session: RwLock::new(SessionState::LoggedOut),
            cache: Mutex::new(None),
            link_base: options.link_base,
            unpublish_poll: options.unpublish_poll,
        }
    }

    /// Log in with email and password.
    ///
    /// # Errors
    /// - `InvalidState` if a login is in progress or a session is active
    /// - `Authentication` if the credentials are rejected
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        {
            let mut state = self.session.write().await;
            match *state {
                SessionState::LoggedOut => *state = SessionState::LoggingIn,
                SessionState::LoggingIn => {
                    return Err(Error::InvalidState("Login already in progress".to_string()))
                }
                SessionState::LoggedIn(_) => {
                    return Err(Error::InvalidState(
                        "Already logged in; log out first".to_string(),
                    ))
                }
            }
        }

        let mut guard = LoginGuard {
            state: &self.session,
            armed: true,
        };
        let result = session::login(&self.api, email, password, token).await;
        guard.armed = false;

        let mut state = self.session.write().await;
        match result {
            Ok(active) => {
                *state = SessionState::LoggedIn(Arc::new(active));
                drop(state);
                self.invalidate().await;
                Ok(())
            }
            Err(err) => {
                *state = SessionState::LoggedOut;
                warn!("Login failed: {}", err);
                Err(err)
            }
        }
    }

    /// End the session on the server and forget all session state.
    ///
    /// Waits for in-flight operations. A failed server-side logout is logged
    /// and the local session is cleared anyway.
    pub async fn logout(&self, token: &CancellationToken) -> Result<()> {
        let mut state = self.session.write().await;
        let active = match &*state {
            SessionState::LoggedIn(active) => active.clone(),
            SessionState::LoggingIn => {
                return Err(Error::InvalidState("Login is still in progress".to_string()))
            }
            SessionState::LoggedOut => return Ok(()),
        };

        if let Err(err) = self
            .api
            .call(Some(&active.sid), json!({"a": "sml"}), token)
            .await
        {
            warn!("Server-side logout failed: {}", err);
        }
        *state = SessionState::LoggedOut;
        drop(state);

        self.invalidate().await;
        info!("Logged out {}", active.email());
        Ok(())
    }

    /// Current login state.
    pub async fn status(&self) -> SessionStatus {
        self.session.read().await.status()
    }

    /// Whether a confirmed session is active.
    pub async fn is_logged_in(&self) -> bool {
        self.status().await == SessionStatus::LoggedIn
    }

    /// Email of the logged-in account.
    pub async fn account_email(&self) -> Option<String> {
        match &*self.session.read().await {
            SessionState::LoggedIn(active) => Some(active.email().to_string()),
            _ => None,
        }
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    async fn fetch_tree(
        &self,
        active: &ActiveSession,
        token: &CancellationToken,
    ) -> Result<NodeTree> {
        let response = self
            .api
            .call(Some(&active.sid), json!({"a": "f", "c": 1}), token)
            .await?;

        let raw: Vec<RawNode> =
            serde_json::from_value(response.get("f").cloned().unwrap_or(Value::Array(vec![])))?;
        let links: Vec<RawPublicHandle> =
            serde_json::from_value(response.get("ph").cloned().unwrap_or(Value::Array(vec![])))?;

        let total = raw.len();
        let nodes: Vec<Node> = raw
            .into_iter()
            .filter_map(|node| node.decrypt(&active.master_key, &active.user_handle))
            .collect();
        debug!("Fetched {} node(s), {} decrypted", total, nodes.len());

        Ok(NodeTree::build(nodes).with_public_handles(links))
    }

    async fn tree_for(
        &self,
        active: &ActiveSession,
        token: &CancellationToken,
    ) -> Result<Arc<NodeTree>> {
        let mut cache = self.cache.lock().await;
        if let Some(tree) = cache.as_ref() {
            return Ok(tree.clone());
        }
        let tree = Arc::new(self.fetch_tree(active, token).await?);
        *cache = Some(tree.clone());
        Ok(tree)
    }

    /// Node snapshot, fetched on first use and after local mutations.
    pub async fn nodes(&self, token: &CancellationToken) -> Result<Arc<NodeTree>> {
        let state = self.session.read().await;
        let active = state.active()?;
        self.tree_for(active, token).await
    }

    /// Drop the cached snapshot and fetch a fresh one.
    pub async fn refresh_nodes(&self, token: &CancellationToken) -> Result<Arc<NodeTree>> {
        let state = self.session.read().await;
        let active = state.active()?;
        self.invalidate().await;
        self.tree_for(active, token).await
    }

    fn created_node(&self, response: &Value, active: &ActiveSession) -> Result<Node> {
        let raw = response
            .get("f")
            .and_then(|f| f.get(0))
            .cloned()
            .ok_or_else(|| Error::Serialization("'p' response lacks the new node".to_string()))?;
        let raw: RawNode = serde_json::from_value(raw)?;
        raw.decrypt(&active.master_key, &active.user_handle)
            .ok_or_else(|| Error::Crypto("Server returned an undecryptable node".to_string()))
    }

    fn folder_in<'t>(tree: &'t NodeTree, handle: &str) -> Result<&'t Node> {
        let node = tree
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("Node {} does not exist", handle)))?;
        if !node.is_folder() {
            return Err(Error::InvalidInput(format!("Node {} is not a folder", handle)));
        }
        Ok(node)
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidInput(format!("Invalid node name '{}'", name)));
        }
        Ok(())
    }

    /// Create a folder under `parent`.
    ///
    /// # Errors
    /// - `AlreadyExists` if `parent` already has a child with this name
    pub async fn create_folder(
        &self,
        parent: &str,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Node> {
        Self::check_name(name)?;
        let state = self.session.read().await;
        let active = state.active()?;
        let tree = self.tree_for(active, token).await?;
        Self::folder_in(&tree, parent)?;
        if tree.children(parent).any(|child| child.name == name) {
            return Err(Error::AlreadyExists(format!(
                "'{}' already exists in {}",
                name, parent
            )));
        }

        let key = NodeKey::Folder(FolderKey::generate());
        let attrs = encrypt_attributes(&NodeAttributes::named(name), key.attribute_key())?;
        let wrapped = wrap_node_key(&active.master_key, &key)?;

        let response = self
            .api
            .call(
                Some(&active.sid),
                json!({
                    "a": "p",
                    "t": parent,
                    "n": [{
                        "h": "xxxxxxxx",
                        "t": 1,
                        "a": base64url_encode(&attrs),
                        "k": base64url_encode(&wrapped),
                    }],
                }),
                token,
            )
            .await?;
        self.invalidate().await;

        let node = self.created_node(&response, active)?;
        info!("Created folder '{}' ({})", name, node.handle);
        Ok(node)
    }

    /// Upload a new file under `parent`.
    ///
    /// An existing file with the same name is left in place; MEGA allows
    /// duplicate names.
    pub async fn upload(
        &self,
        parent: &str,
        name: &str,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<Node> {
        Self::check_name(name)?;
        let state = self.session.read().await;
        let active = state.active()?;
        let tree = self.tree_for(active, token).await?;
        Self::folder_in(&tree, parent)?;

        let (completion, key) =
            transfer::upload(&self.api, &active.sid, source, progress, token).await?;
        let key = NodeKey::File(key);
        let attrs = encrypt_attributes(&NodeAttributes::named(name), key.attribute_key())?;
        let wrapped = wrap_node_key(&active.master_key, &key)?;

        let response = self
            .api
            .call(
                Some(&active.sid),
                json!({
                    "a": "p",
                    "t": parent,
                    "n": [{
                        "h": completion,
                        "t": 0,
                        "a": base64url_encode(&attrs),
                        "k": base64url_encode(&wrapped),
                    }],
                }),
                token,
            )
            .await?;
        self.invalidate().await;

        let node = self.created_node(&response, active)?;
        info!("Uploaded '{}' ({} bytes)", name, node.size);
        Ok(node)
    }

    /// Download a file into `dest`.
    ///
    /// Whole-file downloads are MAC-verified and fail with `CorruptData` on
    /// mismatch. Ranged downloads are decrypted but cannot be verified.
    pub async fn download(
        &self,
        handle: &str,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        range: Option<ByteRange>,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<u64> {
        let state = self.session.read().await;
        let active = state.active()?;
        let tree = self.tree_for(active, token).await?;
        let node = tree
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("Node {} does not exist", handle)))?;
        let key = node.file_key()?;

        let response = self
            .api
            .call(Some(&active.sid), json!({"a": "g", "g": 1, "n": handle}), token)
            .await?;
        let url = response
            .get("g")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Serialization("'g' response lacks 'g'".to_string()))?;
        let size = response
            .get("s")
            .and_then(Value::as_u64)
            .unwrap_or(node.size);

        match range {
            None => {
                transfer::download_full(&self.api, url, key, size, dest, progress, token).await
            }
            Some(range) => {
                transfer::download_range(&self.api, url, key, size, range, dest, progress, token)
                    .await
            }
        }
    }

    /// Delete a node and everything below it.
    pub async fn delete(&self, handle: &str, token: &CancellationToken) -> Result<()> {
        let state = self.session.read().await;
        let active = state.active()?;
        self.api
            .call(Some(&active.sid), json!({"a": "d", "n": handle}), token)
            .await?;
        self.invalidate().await;
        info!("Deleted node {}", handle);
        Ok(())
    }

    /// Export a node and return its public link.
    pub async fn export_link(&self, handle: &str, token: &CancellationToken) -> Result<String> {
        let state = self.session.read().await;
        let active = state.active()?;
        let tree = self.tree_for(active, token).await?;
        let node = tree
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("Node {} does not exist", handle)))?;

        let (kind, key) = match &node.key {
            Some(NodeKey::File(key)) => (LinkKind::File, key.pack().to_vec()),
            Some(NodeKey::Folder(key)) => (LinkKind::Folder, key.as_bytes().to_vec()),
            None => {
                return Err(Error::InvalidInput(format!(
                    "Node {} cannot be exported",
                    handle
                )))
            }
        };

        let response = self
            .api
            .call(Some(&active.sid), json!({"a": "l", "n": handle}), token)
            .await?;
        let public_handle = response
            .as_str()
            .ok_or_else(|| Error::Serialization("'l' response is not a handle".to_string()))?;
        self.invalidate().await;

        let link = PublicLink {
            kind,
            handle: public_handle.to_string(),
            key,
        };
        Ok(link.to_url(&self.link_base))
    }

    /// Revoke a node's public link and wait until it stops resolving.
    ///
    /// The link is looked up in a freshly fetched node list, since it may
    /// have been exported by another session after the cached snapshot.
    ///
    /// # Errors
    /// - `Timeout` if the link still resolves after the poll budget
    pub async fn revoke_link(&self, handle: &str, token: &CancellationToken) -> Result<()> {
        let state = self.session.read().await;
        let active = state.active()?;
        let tree = self.fetch_tree(active, token).await?;
        let node = tree
            .get(handle)
            .ok_or_else(|| Error::NotFound(format!("Node {} does not exist", handle)))?;
        let is_folder = node.is_folder();
        let public_handle = tree.public_handle(handle).map(str::to_string);

        match self
            .api
            .call(Some(&active.sid), json!({"a": "l", "n": handle, "d": 1}), token)
            .await
        {
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        self.invalidate().await;

        let Some(public_handle) = public_handle else {
            debug!("Node {} had no public link", handle);
            return Ok(());
        };

        poll_until(&self.unpublish_poll, token, "public link revocation", || {
            let public_handle = public_handle.as_str();
            async move {
                if is_folder {
                    let tree = self.fetch_tree(active, token).await?;
                    return Ok(match tree.public_handle(handle) {
                        Some(_) => PollStatus::Pending,
                        None => PollStatus::Ready(()),
                    });
                }
                match self
                    .api
                    .call(None, json!({"a": "g", "p": public_handle}), token)
                    .await
                {
                    Err(Error::NotFound(_)) => Ok(PollStatus::Ready(())),
                    Ok(_) => Ok(PollStatus::Pending),
                    Err(err) => Err(err),
                }
            }
        })
        .await?;

        info!("Revoked public link of {}", handle);
        Ok(())
    }

    /// Fetch the name and size of a file behind a public link.
    ///
    /// Works without a session.
    pub async fn resolve_public_link(
        &self,
        link: &str,
        token: &CancellationToken,
    ) -> Result<PublicFile> {
        let link = PublicLink::parse(link)?;
        if link.kind == LinkKind::Folder {
            return Err(Error::NotSupported(
                "Folder links cannot be resolved".to_string(),
            ));
        }

        let response = self
            .api
            .call(None, json!({"a": "g", "p": link.handle}), token)
            .await?;
        let key = FileKey::unpack(&link.key)?;
        let attrs = response
            .get("at")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Serialization("'g' response lacks 'at'".to_string()))?;
        let attrs = decrypt_attributes(&base64url_decode(attrs)?, key.aes_key())?;

        Ok(PublicFile {
            handle: link.handle,
            name: attrs.name,
            size: response.get("s").and_then(Value::as_u64).unwrap_or(0),
        })
    }
}
