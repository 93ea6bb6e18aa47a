//! Hierarchical handle for remote backup objects.
//!
//! A [`BackupEntry`] names one file or folder on a remote provider. It is a
//! transient handle: nothing is persisted, and every provider operation
//! resolves it again by its full path.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Error, Result};

/// Separator used when joining entry names into a path.
pub const PATH_SEPARATOR: char = '/';

/// Whether an entry is a file or a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Folder,
}

/// Remote metadata, filled lazily by providers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryInfo {
    /// Size in bytes, when known.
    pub size: Option<u64>,
    /// Last modification (or creation) time reported by the backend.
    pub modified: Option<DateTime<Utc>>,
    /// Provider-specific identifier (archive id, node handle, etag...).
    pub remote_id: Option<String>,
}

struct EntryInner {
    name: String,
    kind: EntryKind,
    parent: RwLock<Option<BackupEntry>>,
    info: RwLock<EntryInfo>,
}

/// A file or folder in a remote backup store.
///
/// Cloning is cheap and clones share identity: a parent set on one clone is
/// visible through all of them. Parent links are plain shared handles, so a
/// caller can build a cyclic chain; path computation detects that instead of
/// trusting the chain. A cycle keeps its members alive until it is broken
/// with [`BackupEntry::set_parent`].
#[derive(Clone)]
pub struct BackupEntry {
    inner: Arc<EntryInner>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl BackupEntry {
    /// Create a root-level entry.
    ///
    /// The name is not validated here; an empty name is reported by
    /// [`BackupEntry::full_path`].
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                name: name.into(),
                kind,
                parent: RwLock::new(None),
                info: RwLock::new(EntryInfo::default()),
            }),
        }
    }

    /// Create a root-level file entry.
    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, EntryKind::File)
    }

    /// Create a root-level folder entry.
    pub fn folder(name: impl Into<String>) -> Self {
        Self::new(name, EntryKind::Folder)
    }

    /// Create an entry under `self`.
    pub fn child(&self, name: impl Into<String>, kind: EntryKind) -> Self {
        let child = Self::new(name, kind);
        child.set_parent(Some(self.clone()));
        child
    }

    /// Build a chain of entries from a `/`-separated path.
    ///
    /// Every intermediate segment becomes a folder; the last one gets `kind`.
    /// Leading, trailing and repeated separators are ignored.
    ///
    /// # Errors
    /// - `InvalidInput` if the path has no segments
    pub fn from_path(path: &str, kind: EntryKind) -> Result<Self> {
        let segments: Vec<&str> = path
            .split(PATH_SEPARATOR)
            .filter(|s| !s.is_empty())
            .collect();
        Self::from_segments(&segments, kind)
    }

    /// Build a chain of entries from already split segments.
    pub fn from_segments<S: AsRef<str>>(segments: &[S], kind: EntryKind) -> Result<Self> {
        let (last, ancestors) = segments
            .split_last()
            .ok_or_else(|| Error::InvalidInput("Path has no segments".to_string()))?;

        let mut parent: Option<BackupEntry> = None;
        for segment in ancestors {
            let folder = BackupEntry::folder(segment.as_ref());
            folder.set_parent(parent.take());
            parent = Some(folder);
        }

        let entry = BackupEntry::new(last.as_ref(), kind);
        entry.set_parent(parent);
        Ok(entry)
    }

    /// Entry name (last path segment).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Entry kind.
    pub fn kind(&self) -> EntryKind {
        self.inner.kind
    }

    /// Check if this entry is a folder.
    pub fn is_folder(&self) -> bool {
        self.inner.kind == EntryKind::Folder
    }

    /// Current parent, if any.
    pub fn parent(&self) -> Option<BackupEntry> {
        read(&self.inner.parent).clone()
    }

    /// Replace the parent reference.
    pub fn set_parent(&self, parent: Option<BackupEntry>) {
        *write(&self.inner.parent) = parent;
    }

    /// Size in bytes, if filled.
    pub fn size(&self) -> Option<u64> {
        read(&self.inner.info).size
    }

    /// Set the size.
    pub fn set_size(&self, size: Option<u64>) {
        write(&self.inner.info).size = size;
    }

    /// Modification time, if filled.
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        read(&self.inner.info).modified
    }

    /// Provider-specific identifier, if filled.
    pub fn remote_id(&self) -> Option<String> {
        read(&self.inner.info).remote_id.clone()
    }

    /// Snapshot of the remote metadata.
    pub fn info(&self) -> EntryInfo {
        read(&self.inner.info).clone()
    }

    /// Replace the remote metadata.
    pub fn set_info(&self, info: EntryInfo) {
        *write(&self.inner.info) = info;
    }

    /// Whether `self` and `other` are the same entry (identity, not name).
    pub fn same_entry(&self, other: &BackupEntry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Names from the root of the chain down to this entry.
    ///
    /// # Errors
    /// - `InvalidState` if any entry in the chain has an empty name
    /// - `InvalidState` if the chain revisits an entry (including itself)
    pub fn segments(&self) -> Result<Vec<String>> {
        let mut visited: HashSet<*const EntryInner> = HashSet::new();
        let mut names = Vec::new();
        let mut current = Some(self.clone());

        while let Some(entry) = current {
            if !visited.insert(Arc::as_ptr(&entry.inner)) {
                return Err(Error::InvalidState(format!(
                    "Parent chain of '{}' contains a cycle at '{}'",
                    self.name(),
                    entry.name()
                )));
            }
            if entry.name().is_empty() {
                return Err(Error::InvalidState(format!(
                    "Parent chain of '{}' contains an entry with an empty name",
                    self.name()
                )));
            }
            names.push(entry.name().to_string());
            current = entry.parent();
        }

        names.reverse();
        Ok(names)
    }

    /// Full `/`-joined path from the root of the chain to this entry.
    ///
    /// Pure function of the chain at call time. See [`BackupEntry::segments`]
    /// for the failure modes.
    pub fn full_path(&self) -> Result<String> {
        Ok(self.segments()?.join("/"))
    }

    /// Whether this entry lies under `ancestor`, compared by path segments.
    ///
    /// An entry is not within itself.
    pub fn is_within(&self, ancestor: &BackupEntry) -> Result<bool> {
        let own = self.segments()?;
        let other = ancestor.segments()?;
        Ok(own.len() > other.len() && own.starts_with(&other))
    }
}

impl fmt::Debug for BackupEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the direct parent's name: the chain may be cyclic.
        let parent = self.parent().map(|p| p.name().to_string());
        f.debug_struct("BackupEntry")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("parent", &parent)
            .field("info", &self.info())
            .finish()
    }
}

/// Check that `path` lies under the `/`-separated `ancestor` path.
///
/// An empty ancestor matches everything.
pub fn path_is_within(path: &str, ancestor: &str) -> bool {
    let ancestor = ancestor.trim_matches(PATH_SEPARATOR);
    if ancestor.is_empty() {
        return true;
    }
    path.strip_prefix(ancestor)
        .map(|rest| rest.starts_with(PATH_SEPARATOR))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_path_three_levels() {
        let root = BackupEntry::folder("root");
        let folder = root.child("folder", EntryKind::Folder);
        let file = folder.child("test.txt", EntryKind::File);

        assert_eq!(file.full_path().unwrap(), "root/folder/test.txt");
    }

    #[test]
    fn test_single_entry_path() {
        assert_eq!(BackupEntry::file("a.txt").full_path().unwrap(), "a.txt");
    }

    #[test]
    fn test_empty_name_fails() {
        let root = BackupEntry::folder("");
        let file = root.child("test.txt", EntryKind::File);

        assert!(matches!(file.full_path(), Err(Error::InvalidState(_))));
        assert!(matches!(
            BackupEntry::file("").full_path(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_self_reference_fails() {
        let entry = BackupEntry::folder("loop");
        entry.set_parent(Some(entry.clone()));

        assert!(matches!(entry.full_path(), Err(Error::InvalidState(_))));
        entry.set_parent(None);
    }

    #[test]
    fn test_longer_cycle_fails() {
        let a = BackupEntry::folder("a");
        let b = a.child("b", EntryKind::Folder);
        let c = b.child("c", EntryKind::File);
        a.set_parent(Some(c.clone()));

        assert!(matches!(c.full_path(), Err(Error::InvalidState(_))));
        assert!(matches!(b.full_path(), Err(Error::InvalidState(_))));
        a.set_parent(None);
        assert_eq!(c.full_path().unwrap(), "a/b/c");
    }

    #[test]
    fn test_same_names_are_not_a_cycle() {
        let a = BackupEntry::folder("x");
        let b = a.child("x", EntryKind::Folder);
        let c = b.child("x", EntryKind::File);
        assert_eq!(c.full_path().unwrap(), "x/x/x");
    }

    #[test]
    fn test_from_path_builds_chain() {
        let entry = BackupEntry::from_path("folder/subfolder/file.txt", EntryKind::File).unwrap();

        assert_eq!(entry.name(), "file.txt");
        assert_eq!(entry.kind(), EntryKind::File);
        let parent = entry.parent().unwrap();
        assert_eq!(parent.name(), "subfolder");
        assert!(parent.is_folder());
        let grandparent = parent.parent().unwrap();
        assert_eq!(grandparent.name(), "folder");
        assert!(grandparent.parent().is_none());
    }

    #[test]
    fn test_from_path_ignores_extra_separators() {
        let entry = BackupEntry::from_path("/a//b/", EntryKind::Folder).unwrap();
        assert_eq!(entry.full_path().unwrap(), "a/b");
    }

    #[test]
    fn test_from_path_empty_fails() {
        assert!(BackupEntry::from_path("", EntryKind::File).is_err());
        assert!(BackupEntry::from_path("///", EntryKind::File).is_err());
    }

    #[test]
    fn test_is_within() {
        let folder = BackupEntry::from_path("a/b", EntryKind::Folder).unwrap();
        let file = BackupEntry::from_path("a/b/c.txt", EntryKind::File).unwrap();
        let other = BackupEntry::from_path("a/bc/c.txt", EntryKind::File).unwrap();

        assert!(file.is_within(&folder).unwrap());
        assert!(!other.is_within(&folder).unwrap());
        assert!(!folder.is_within(&folder).unwrap());
    }

    #[test]
    fn test_path_is_within() {
        assert!(path_is_within("a/b/c", "a/b"));
        assert!(path_is_within("a/b/c", ""));
        assert!(!path_is_within("a/bc", "a/b"));
        assert!(!path_is_within("a/b", "a/b"));
    }

    #[test]
    fn test_info_is_shared_between_clones() {
        let entry = BackupEntry::file("f");
        let clone = entry.clone();
        clone.set_size(Some(42));
        assert_eq!(entry.size(), Some(42));
        assert!(entry.same_entry(&clone));
        assert!(!entry.same_entry(&BackupEntry::file("f")));
    }

    proptest::proptest! {
        #[test]
        fn prop_from_path_round_trips(
            segments in proptest::collection::vec("[a-zA-Z0-9._ -]{1,12}", 1..6)
        ) {
            let path = segments.join("/");
            let entry = BackupEntry::from_path(&path, EntryKind::File).unwrap();
            proptest::prop_assert_eq!(entry.full_path().unwrap(), path);
            proptest::prop_assert_eq!(entry.segments().unwrap(), segments);
        }
    }

    #[test]
    fn test_debug_on_cycle_terminates() {
        let entry = BackupEntry::folder("loop");
        entry.set_parent(Some(entry.clone()));
        let rendered = format!("{:?}", entry);
        assert!(rendered.contains("loop"));
        entry.set_parent(None);
    }
}
