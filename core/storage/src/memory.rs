//! In-memory backup service for testing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::io::AsyncWrite;
use uuid::Uuid;

use stowage_common::cancel::run_cancellable;
use stowage_common::entry::path_is_within;
use stowage_common::pattern::matches_pattern;
use stowage_common::transfer::{with_progress, write_stream};
use stowage_common::{
    BackupEntry, ByteRange, ByteStream, CancellationToken, EntryInfo, EntryKind, Error,
    NamePattern, ProgressCallback, ProgressTracker, Result, SizedStream,
};

use crate::service::{
    child_prefix, entry_at, listing_path, BackupService, EntryStream, ProviderKind,
};

/// Frame size used when streaming downloads.
const FRAME_SIZE: usize = 64 * 1024;

/// Scheme and host of issued public links.
const PUBLIC_BASE: &str = "memory://public/";

#[derive(Debug, Clone)]
enum Stored {
    File { data: Bytes, info: EntryInfo },
    Folder { info: EntryInfo },
}

impl Stored {
    fn kind(&self) -> EntryKind {
        match self {
            Stored::File { .. } => EntryKind::File,
            Stored::Folder { .. } => EntryKind::Folder,
        }
    }

    fn info(&self) -> &EntryInfo {
        match self {
            Stored::File { info, .. } | Stored::Folder { info } => info,
        }
    }
}

#[derive(Debug, Clone)]
struct PublicLink {
    path: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Stored>,
    links: HashMap<String, PublicLink>,
}

impl State {
    fn require_folder(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Ok(());
        }
        match self.entries.get(path) {
            Some(Stored::Folder { .. }) => Ok(()),
            Some(Stored::File { .. }) => {
                Err(Error::InvalidInput(format!("'{}' is a file", path)))
            }
            None => Err(Error::NotFound(format!("Folder '{}' does not exist", path))),
        }
    }

    fn drop_links(&mut self, path: &str) {
        self.links
            .retain(|_, link| link.path != path && !path_is_within(&link.path, path));
    }
}

/// In-memory backup service.
///
/// Useful for testing and development. Folders are real, uploads replace
/// existing files and public links resolve through
/// [`MemoryService::resolve_public`]. All data is lost on drop.
#[derive(Default)]
pub struct MemoryService {
    state: RwLock<State>,
}

fn parent_path(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn new_info(size: Option<u64>) -> EntryInfo {
    EntryInfo {
        size,
        modified: Some(Utc::now()),
        remote_id: Some(Uuid::new_v4().to_string()),
    }
}

impl MemoryService {
    /// Create a new empty service.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the content behind a public link.
    ///
    /// # Errors
    /// - `NotFound` if the link was never issued, was revoked or has expired
    pub fn resolve_public(&self, url: &str) -> Result<Bytes> {
        let state = self.read();
        let link = state
            .links
            .get(url)
            .ok_or_else(|| Error::NotFound(format!("Public link {} does not resolve", url)))?;
        if link.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(Error::NotFound(format!("Public link {} has expired", url)));
        }
        match state.entries.get(&link.path) {
            Some(Stored::File { data, .. }) => Ok(data.clone()),
            _ => Err(Error::NotFound(format!("Public link {} does not resolve", url))),
        }
    }

    fn list(&self, parent: &str, pattern: Option<&NamePattern>) -> Result<Vec<BackupEntry>> {
        let state = self.read();
        state.require_folder(parent)?;

        let prefix = child_prefix(parent);
        let mut found = Vec::new();
        for (path, stored) in state.entries.iter() {
            let Some(name) = path.strip_prefix(&prefix) else {
                continue;
            };
            if name.is_empty() || name.contains('/') || !matches_pattern(pattern, name) {
                continue;
            }
            found.push(entry_at(path, stored.kind(), stored.info().clone())?);
        }
        Ok(found)
    }

    async fn collect(
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<Bytes> {
        let mut stream = with_progress(source.into_checked_stream(), progress);
        let mut data = BytesMut::new();
        while let Some(chunk) = run_cancellable(token, async { Ok(stream.next().await) }).await? {
            data.extend_from_slice(&chunk?);
        }
        Ok(data.freeze())
    }
}

#[async_trait]
impl BackupService for MemoryService {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    fn can_folders(&self) -> bool {
        true
    }

    async fn create_folder(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        run_cancellable(token, async {
            let mut state = self.write();
            state.require_folder(parent_path(&path))?;
            match state.entries.get(&path) {
                Some(Stored::Folder { .. }) => Ok(()),
                Some(Stored::File { .. }) => Err(Error::AlreadyExists(
                    "A file already exists at this path".to_string(),
                )),
                None => {
                    state.entries.insert(
                        path.clone(),
                        Stored::Folder {
                            info: new_info(None),
                        },
                    );
                    Ok(())
                }
            }
        })
        .await
        .map_err(|e| e.at("memory", &path))
    }

    fn find(
        &self,
        parent: Option<BackupEntry>,
        pattern: Option<NamePattern>,
        token: CancellationToken,
    ) -> EntryStream<'_> {
        let listed = stream::once(async move {
            let path = listing_path(parent.as_ref())?;
            run_cancellable(&token, async { self.list(&path, pattern.as_ref()) })
                .await
                .map_err(|e| e.at("memory", &path))
        });
        Box::pin(
            listed
                .map(|result| match result {
                    Ok(entries) => stream::iter(entries.into_iter().map(Ok)).left_stream(),
                    Err(err) => stream::once(async move { Err(err) }).right_stream(),
                })
                .flatten(),
        )
    }

    async fn fill_info(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        let info = run_cancellable(token, async {
            self.read()
                .entries
                .get(&path)
                .map(|stored| stored.info().clone())
                .ok_or_else(|| Error::NotFound("Entry does not exist".to_string()))
        })
        .await
        .map_err(|e| e.at("memory", &path))?;
        entry.set_info(info);
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
        let result: Result<()> = async {
            self.read().require_folder(parent_path(&path))?;
            let data = Self::collect(source, progress, token).await?;

            let mut state = self.write();
            if let Some(Stored::Folder { .. }) = state.entries.get(&path) {
                return Err(Error::AlreadyExists(
                    "A folder already exists at this path".to_string(),
                ));
            }
            let info = new_info(Some(data.len() as u64));
            state.entries.insert(path.clone(), Stored::File { data, info: info.clone() });
            drop(state);
            entry.set_info(info);
            Ok(())
        }
        .await;
        result.map_err(|e| e.at("memory", &path))
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
            let data = match self.read().entries.get(&path) {
                Some(Stored::File { data, .. }) => data.clone(),
                Some(Stored::Folder { .. }) => {
                    return Err(Error::InvalidInput("Cannot download a folder".to_string()))
                }
                None => return Err(Error::NotFound("Entry does not exist".to_string())),
            };
            let data = match range {
                Some(range) => {
                    let (start, end) = range.resolve(data.len() as u64)?;
                    data.slice(start as usize..=end as usize)
                }
                None => data,
            };

            let frames: Vec<Result<Bytes>> = data
                .chunks(FRAME_SIZE)
                .map(|frame| Ok(Bytes::copy_from_slice(frame)))
                .collect();
            let stream: ByteStream = Box::pin(stream::iter(frames));
            let mut tracker = ProgressTracker::new(progress);
            write_stream(stream, dest, &mut tracker, token).await
        }
        .await;
        result.map_err(|e| e.at("memory", &path))
    }

    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        run_cancellable(token, async {
            let mut state = self.write();
            match state.entries.get(&path) {
                Some(Stored::File { .. }) => {
                    state.entries.remove(&path);
                }
                Some(Stored::Folder { .. }) => {
                    state
                        .entries
                        .retain(|key, _| key != &path && !path_is_within(key, &path));
                }
                None => return Err(Error::NotFound("Entry does not exist".to_string())),
            }
            state.drop_links(&path);
            Ok(())
        })
        .await
        .map_err(|e| e.at("memory", &path))
    }

    async fn publish(
        &self,
        entry: &BackupEntry,
        expires_in: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<String> {
        let path = entry.full_path()?;
        run_cancellable(token, async {
            let mut state = self.write();
            match state.entries.get(&path) {
                Some(Stored::File { .. }) => {}
                Some(Stored::Folder { .. }) => {
                    return Err(Error::NotSupported(
                        "Folders cannot be published".to_string(),
                    ))
                }
                None => return Err(Error::NotFound("Entry does not exist".to_string())),
            }

            let expires_at = expires_in
                .map(|d| {
                    chrono::Duration::from_std(d)
                        .map(|d| Utc::now() + d)
                        .map_err(|_| Error::InvalidInput("Expiry is too far out".to_string()))
                })
                .transpose()?;
            let url = format!("{}{}", PUBLIC_BASE, Uuid::new_v4());
            state.links.insert(
                url.clone(),
                PublicLink {
                    path: path.clone(),
                    expires_at,
                },
            );
            Ok(url)
        })
        .await
        .map_err(|e| e.at("memory", &path))
    }

    async fn unpublish(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()> {
        let path = entry.full_path()?;
        run_cancellable(token, async {
            self.write().links.retain(|_, link| link.path != path);
            Ok(())
        })
        .await
    }
}

/// Create an empty in-memory service; the configuration is ignored.
pub fn create_memory_service(_config: Value) -> Result<Arc<dyn BackupService>> {
    Ok(Arc::new(MemoryService::new()))
}
