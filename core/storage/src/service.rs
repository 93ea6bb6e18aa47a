//! Backup service trait definition.

use async_trait::async_trait;
use futures::{stream, Stream, TryStreamExt};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;

use stowage_common::{
    BackupEntry, ByteRange, CancellationToken, EntryInfo, EntryKind, Error, NamePattern,
    ProgressCallback, Result, SizedStream,
};

/// Lazy stream of entries produced by [`BackupService::find`].
pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<BackupEntry>> + Send + 'a>>;

/// Backend family of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    AmazonS3,
    AmazonGlacier,
    AzureBlob,
    YandexDisk,
    Mega,
    Memory,
}

impl ProviderKind {
    /// Registry name of the provider.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::AmazonS3 => "s3",
            ProviderKind::AmazonGlacier => "glacier",
            ProviderKind::AzureBlob => "azure",
            ProviderKind::YandexDisk => "yandex",
            ProviderKind::Mega => "mega",
            ProviderKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified contract over remote backup stores.
///
/// Entries are addressed by their full path (the chain of parent names).
/// Every operation takes a [`CancellationToken`]; a fired token surfaces as
/// `Error::Cancelled`. Failures carry the provider and path they concern.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Backend family.
    fn kind(&self) -> ProviderKind;

    /// Provider name, as registered.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Whether the backend models real folders.
    ///
    /// When `false`, folders are implied by the paths of the files below
    /// them and [`BackupService::create_folder`] only validates its input.
    fn can_folders(&self) -> bool;

    /// Create a folder.
    ///
    /// # Errors
    /// - `AlreadyExists` on backends with real folders that refuse to
    ///   create one twice
    /// - `NotFound` if the parent folder does not exist
    async fn create_folder(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()>;

    /// List the direct children of `parent` (the root when `None`).
    ///
    /// The stream is lazy and paginates internally; every call starts from
    /// scratch. Yielded entries carry their metadata and a parent chain
    /// built from their full path. `pattern` is matched against names.
    fn find(
        &self,
        parent: Option<BackupEntry>,
        pattern: Option<NamePattern>,
        token: CancellationToken,
    ) -> EntryStream<'_>;

    /// Resolve the entry's remote metadata by full path and store it on the
    /// entry.
    ///
    /// # Errors
    /// - `NotFound` if nothing exists at the path
    async fn fill_info(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()>;

    /// Upload `source` to the entry's path.
    ///
    /// `progress` receives cumulative bytes sent. At most one part of the
    /// payload is held in memory.
    async fn upload(
        &self,
        entry: &BackupEntry,
        source: SizedStream,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Download the entry into `dest` and return the bytes written.
    ///
    /// `range` is inclusive.
    ///
    /// # Errors
    /// - `NotSupported` if the backend cannot serve ranges
    async fn download(
        &self,
        entry: &BackupEntry,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        range: Option<ByteRange>,
        progress: Option<ProgressCallback>,
        token: &CancellationToken,
    ) -> Result<u64>;

    /// Delete the entry at its full path.
    async fn delete(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()>;

    /// Make the entry publicly readable and return its URL.
    ///
    /// Publishing twice returns a working URL both times.
    async fn publish(
        &self,
        entry: &BackupEntry,
        expires_in: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<String>;

    /// Revoke public access. Revoking an unpublished entry succeeds.
    ///
    /// # Errors
    /// - `NotSupported` if the backend cannot revoke links
    async fn unpublish(&self, entry: &BackupEntry, token: &CancellationToken) -> Result<()>;
}

/// Full path of the folder being listed; empty for the root.
pub(crate) fn listing_path(parent: Option<&BackupEntry>) -> Result<String> {
    match parent {
        Some(parent) => parent.full_path(),
        None => Ok(String::new()),
    }
}

/// Key prefix for the direct children of `path` on flat object stores.
pub(crate) fn child_prefix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!("{}/", path)
    }
}

/// Build an entry at `path` with a fresh parent chain and metadata.
pub(crate) fn entry_at(path: &str, kind: EntryKind, info: EntryInfo) -> Result<BackupEntry> {
    let entry = BackupEntry::from_path(path, kind)?;
    entry.set_info(info);
    Ok(entry)
}

/// Join a listed folder path and a child name.
pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Stream that fails once with `err`.
pub(crate) fn failed_stream<'a>(err: Error) -> EntryStream<'a> {
    Box::pin(stream::once(async move { Err(err) }))
}

/// Entry stream over a listing produced in one call.
pub(crate) fn once_listing<'a, Fut>(listing: Fut) -> EntryStream<'a>
where
    Fut: Future<Output = Result<Vec<BackupEntry>>> + Send + 'a,
{
    Box::pin(
        stream::once(listing)
            .map_ok(|entries| stream::iter(entries.into_iter().map(Ok)))
            .try_flatten(),
    )
}

/// Flatten a paginated listing into an entry stream.
///
/// `fetch` receives the cursor returned by the previous page (`None` for
/// the first one) and returns the page's entries with the next cursor.
/// Pages are only fetched as the stream is polled.
pub(crate) fn paginate<'a, C, F, Fut>(fetch: F) -> EntryStream<'a>
where
    C: Send + 'a,
    F: FnMut(Option<C>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<(Vec<BackupEntry>, Option<C>)>> + Send + 'a,
{
    let pages = stream::try_unfold((Some(None), fetch), |(cursor, mut fetch)| async move {
        let Some(cursor) = cursor else {
            return Ok::<_, Error>(None);
        };
        let (entries, next) = fetch(cursor).await?;
        Ok(Some((entries, (next.map(Some), fetch))))
    });
    Box::pin(
        pages
            .map_ok(|entries| stream::iter(entries.into_iter().map(Ok)))
            .try_flatten(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert_eq!(ProviderKind::AmazonS3.as_str(), "s3");
        assert_eq!(ProviderKind::AmazonGlacier.to_string(), "glacier");
        assert_eq!(ProviderKind::YandexDisk.as_str(), "yandex");
    }

    #[test]
    fn test_entry_at_builds_chain() {
        let info = EntryInfo {
            size: Some(4),
            ..EntryInfo::default()
        };
        let entry = entry_at("a/b/c.txt", EntryKind::File, info).unwrap();

        assert_eq!(entry.name(), "c.txt");
        assert_eq!(entry.size(), Some(4));
        let parent = entry.parent().unwrap();
        assert_eq!(parent.name(), "b");
        assert!(parent.is_folder());
        assert_eq!(parent.parent().unwrap().name(), "a");
    }

    #[tokio::test]
    async fn test_paginate_follows_cursor() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let listing = paginate(|cursor: Option<u32>| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                let page = cursor.unwrap_or(0);
                let entry = BackupEntry::file(format!("file{}", page));
                let next = (page < 2).then_some(page + 1);
                Ok((vec![entry], next))
            }
        });

        let names: Vec<String> = listing
            .map_ok(|e| e.name().to_string())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(names, vec!["file0", "file1", "file2"]);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn test_paths() {
        assert_eq!(listing_path(None).unwrap(), "");
        let folder = BackupEntry::from_path("x/y", EntryKind::Folder).unwrap();
        assert_eq!(listing_path(Some(&folder)).unwrap(), "x/y");
        assert_eq!(child_prefix(""), "");
        assert_eq!(child_prefix("x/y"), "x/y/");
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("x", "a"), "x/a");
    }
}
