//! Vault inventory and the path index built from it.

use chrono::{DateTime, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

use stowage_common::pattern::matches_pattern;
use stowage_common::{BackupEntry, EntryInfo, EntryKind, Error, NamePattern, Result};

/// Longest archive description Glacier accepts.
pub const MAX_DESCRIPTION_LENGTH: usize = 1024;

/// Characters escaped inside a path segment. Non-ASCII bytes are always
/// escaped, which keeps descriptions in printable ASCII.
const SEGMENT_ENCODE: &AsciiSet = &CONTROLS.add(b'/').add(b'%');

/// One archive as listed by an inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveRecord {
    pub archive_id: String,
    #[serde(default)]
    pub archive_description: String,
    pub creation_date: DateTime<Utc>,
    pub size: u64,
    #[serde(rename = "SHA256TreeHash", default)]
    pub sha256_tree_hash: String,
}

impl ArchiveRecord {
    /// Metadata exposed on entries.
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            size: Some(self.size),
            modified: Some(self.creation_date),
            remote_id: Some(self.archive_id.clone()),
        }
    }

    /// Newest first; ties go to the greatest archive id.
    fn newest_first(a: &ArchiveRecord, b: &ArchiveRecord) -> Ordering {
        b.creation_date
            .cmp(&a.creation_date)
            .then_with(|| b.archive_id.cmp(&a.archive_id))
    }
}

/// Output of an inventory-retrieval job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Inventory {
    #[serde(rename = "VaultARN", default)]
    pub vault_arn: String,
    pub inventory_date: DateTime<Utc>,
    #[serde(default)]
    pub archive_list: Vec<ArchiveRecord>,
}

/// Encode path segments into an archive description.
///
/// # Errors
/// - `InvalidInput` if there are no segments, one is empty, or the result
///   exceeds [`MAX_DESCRIPTION_LENGTH`]
pub fn encode_description<S: AsRef<str>>(segments: &[S]) -> Result<String> {
    if segments.is_empty() || segments.iter().any(|s| s.as_ref().is_empty()) {
        return Err(Error::InvalidInput(
            "Archive path has an empty segment".to_string(),
        ));
    }
    let description = segments
        .iter()
        .map(|s| utf8_percent_encode(s.as_ref(), SEGMENT_ENCODE).to_string())
        .collect::<Vec<_>>()
        .join("/");
    if description.len() > MAX_DESCRIPTION_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Archive description is {} bytes; Glacier allows {}",
            description.len(),
            MAX_DESCRIPTION_LENGTH
        )));
    }
    Ok(description)
}

/// Decode an archive description into path segments.
///
/// # Errors
/// - `Serialization` if a segment is empty or not valid UTF-8 once decoded
pub fn decode_description(description: &str) -> Result<Vec<String>> {
    description
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                return Err(Error::Serialization(format!(
                    "Archive description '{}' has an empty segment",
                    description
                )));
            }
            percent_decode_str(segment)
                .decode_utf8()
                .map(|s| s.into_owned())
                .map_err(|e| {
                    Error::Serialization(format!(
                        "Archive description '{}' is not UTF-8: {}",
                        description, e
                    ))
                })
        })
        .collect()
}

/// Archives grouped by the path their description encodes.
///
/// Every path keeps all of its archives, newest first.
#[derive(Debug, Clone, Default)]
pub struct ArchiveIndex {
    by_path: BTreeMap<Vec<String>, Vec<ArchiveRecord>>,
}

impl ArchiveIndex {
    /// Index `records`; archives with undecodable descriptions are skipped.
    pub fn build(records: impl IntoIterator<Item = ArchiveRecord>) -> Self {
        let mut by_path: BTreeMap<Vec<String>, Vec<ArchiveRecord>> = BTreeMap::new();
        for record in records {
            match decode_description(&record.archive_description) {
                Ok(segments) => by_path.entry(segments).or_default().push(record),
                Err(err) => warn!("Skipping archive {}: {}", record.archive_id, err),
            }
        }
        for versions in by_path.values_mut() {
            versions.sort_by(ArchiveRecord::newest_first);
        }
        Self { by_path }
    }

    /// Newest archive at `segments`.
    pub fn newest(&self, segments: &[String]) -> Option<&ArchiveRecord> {
        self.versions(segments).first()
    }

    /// Every archive at `segments`, newest first.
    pub fn versions(&self, segments: &[String]) -> &[ArchiveRecord] {
        self.by_path
            .get(segments)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every archive strictly below the folder at `segments`.
    pub fn below(&self, segments: &[String]) -> Vec<&ArchiveRecord> {
        self.by_path
            .iter()
            .filter(|(path, _)| path.len() > segments.len() && path.starts_with(segments))
            .flat_map(|(_, versions)| versions.iter())
            .collect()
    }

    /// Whether any archive lies below the folder at `segments`.
    pub fn has_folder(&self, segments: &[String]) -> bool {
        self.by_path
            .keys()
            .any(|path| path.len() > segments.len() && path.starts_with(segments))
    }

    /// Direct children of the folder at `parent`.
    ///
    /// Files carry the metadata of their newest archive. Deeper paths
    /// contribute one folder entry for their first segment below `parent`.
    pub fn children(
        &self,
        parent: &[String],
        pattern: Option<&NamePattern>,
    ) -> Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();
        let mut folders = HashSet::new();

        for (path, versions) in &self.by_path {
            if path.len() <= parent.len() || !path.starts_with(parent) {
                continue;
            }
            let name = &path[parent.len()];
            if !matches_pattern(pattern, name) {
                continue;
            }
            if path.len() == parent.len() + 1 {
                let entry = BackupEntry::from_segments(path.as_slice(), EntryKind::File)?;
                if let Some(newest) = versions.first() {
                    entry.set_info(newest.info());
                }
                entries.push(entry);
            } else if folders.insert(name.clone()) {
                let folder = &path[..parent.len() + 1];
                entries.push(BackupEntry::from_segments(folder, EntryKind::Folder)?);
            }
        }
        Ok(entries)
    }

    /// Number of distinct paths.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
