//! Command implementations over any configured backup service.

use anyhow::{Context, Result};
use futures::TryStreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use stowage_common::{
    BackupEntry, ByteRange, CancellationToken, EntryKind, NamePattern, ProgressCallback,
    SizedStream,
};
use stowage_storage::BackupService;

fn kind_of(folder: bool) -> EntryKind {
    if folder {
        EntryKind::Folder
    } else {
        EntryKind::File
    }
}

fn entry(path: &str, folder: bool) -> Result<BackupEntry> {
    BackupEntry::from_path(path, kind_of(folder))
        .with_context(|| format!("Invalid path '{}'", path))
}

fn progress_logger(label: &str) -> ProgressCallback {
    let label = label.to_string();
    Arc::new(move |bytes| debug!("{}: {} bytes", label, bytes))
}

/// Parse `start-end`, `start-` or a single offset into a byte range.
pub fn parse_range(value: &str) -> std::result::Result<ByteRange, String> {
    let (start, end) = match value.split_once('-') {
        Some((start, end)) => (start, (!end.is_empty()).then_some(end)),
        None => (value, Some(value)),
    };
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| format!("Invalid range start in '{}'", value))?;
    let end = end
        .map(|end| end.trim().parse::<u64>())
        .transpose()
        .map_err(|_| format!("Invalid range end in '{}'", value))?;
    ByteRange::new(start, end).map_err(|e| e.to_string())
}

/// List the direct children of `path` (the root when `None`).
pub async fn list(
    service: &dyn BackupService,
    path: Option<&str>,
    pattern: Option<&str>,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let parent = path.map(|p| entry(p, true)).transpose()?;
    let pattern = pattern.map(NamePattern::new);
    let entries: Vec<BackupEntry> = service
        .find(parent, pattern, token.clone())
        .try_collect()
        .await
        .context("Failed to list entries")?;

    if entries.is_empty() {
        writeln!(out, "No entries.")?;
        return Ok(());
    }
    for entry in entries {
        if entry.is_folder() {
            writeln!(out, "  [DIR]  {}/", entry.name())?;
        } else {
            let size = entry.size().map(|s| format!("{} bytes", s)).unwrap_or_default();
            writeln!(out, "  [FILE] {} ({})", entry.name(), size)?;
        }
    }
    Ok(())
}

/// Show the remote metadata of an entry.
pub async fn show_info(
    service: &dyn BackupService,
    path: &str,
    folder: bool,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let entry = entry(path, folder)?;
    service
        .fill_info(&entry, token)
        .await
        .with_context(|| format!("Failed to look up '{}'", path))?;

    let info = entry.info();
    writeln!(out, "Entry: {}", entry.full_path()?)?;
    writeln!(out, "  Provider: {}", service.name())?;
    if let Some(size) = info.size {
        writeln!(out, "  Size: {} bytes", size)?;
    }
    if let Some(modified) = info.modified {
        writeln!(out, "  Modified: {}", modified.to_rfc3339())?;
    }
    if let Some(id) = info.remote_id {
        writeln!(out, "  Remote ID: {}", id)?;
    }
    Ok(())
}

/// Upload a local file.
pub async fn put(
    service: &dyn BackupService,
    local: &Path,
    remote: &str,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    info!("Uploading {} to {}", local.display(), remote);
    let file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("Failed to open {}", local.display()))?;
    let length = file
        .metadata()
        .await
        .context("Failed to read file size")?
        .len();

    let entry = entry(remote, false)?;
    service
        .upload(
            &entry,
            SizedStream::from_reader(file, length),
            Some(progress_logger("upload")),
            token,
        )
        .await
        .context("Failed to upload file")?;

    writeln!(out, "Uploaded {} ({} bytes)", remote, length)?;
    Ok(())
}

/// Download a remote file, optionally only a byte range of it.
pub async fn get(
    service: &dyn BackupService,
    remote: &str,
    local: &Path,
    range: Option<ByteRange>,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    info!("Downloading {} to {}", remote, local.display());
    let entry = entry(remote, false)?;
    let mut file = tokio::fs::File::create(local)
        .await
        .with_context(|| format!("Failed to create {}", local.display()))?;

    let written = service
        .download(&entry, &mut file, range, Some(progress_logger("download")), token)
        .await
        .context("Failed to download file")?;
    file.flush().await.context("Failed to write output file")?;

    writeln!(out, "Downloaded {} ({} bytes)", local.display(), written)?;
    Ok(())
}

/// Delete a remote entry.
pub async fn remove(
    service: &dyn BackupService,
    path: &str,
    folder: bool,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let entry = entry(path, folder)?;
    service
        .delete(&entry, token)
        .await
        .with_context(|| format!("Failed to remove '{}'", path))?;
    writeln!(out, "Removed: {}", path)?;
    Ok(())
}

/// Create a remote folder.
pub async fn mkdir(
    service: &dyn BackupService,
    path: &str,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let entry = entry(path, true)?;
    service
        .create_folder(&entry, token)
        .await
        .with_context(|| format!("Failed to create folder '{}'", path))?;
    if !service.can_folders() {
        debug!("{} has no real folders; '{}' exists once files are added", service.name(), path);
    }
    writeln!(out, "Folder created: {}", path)?;
    Ok(())
}

/// Publish an entry and print its URL.
pub async fn publish(
    service: &dyn BackupService,
    path: &str,
    folder: bool,
    expires_in: Option<Duration>,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let entry = entry(path, folder)?;
    let url = service
        .publish(&entry, expires_in, token)
        .await
        .with_context(|| format!("Failed to publish '{}'", path))?;
    writeln!(out, "{}", url)?;
    Ok(())
}

/// Revoke public access to an entry.
pub async fn unpublish(
    service: &dyn BackupService,
    path: &str,
    folder: bool,
    token: &CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let entry = entry(path, folder)?;
    service
        .unpublish(&entry, token)
        .await
        .with_context(|| format!("Failed to unpublish '{}'", path))?;
    writeln!(out, "Unpublished: {}", path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_storage::MemoryService;

    fn output(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("10-19").unwrap(), ByteRange::new(10, Some(19)).unwrap());
        assert_eq!(parse_range("10-").unwrap(), ByteRange::new(10, None).unwrap());
        assert_eq!(parse_range("7").unwrap(), ByteRange::new(7, Some(7)).unwrap());
        assert!(parse_range("19-10").is_err());
        assert!(parse_range("a-b").is_err());
    }

    #[tokio::test]
    async fn test_put_ls_get_rm() {
        let service = MemoryService::new();
        let token = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, b"remember the milk").unwrap();

        let mut out: Vec<u8> = Vec::new();
        mkdir(&service, "docs", &token, &mut out).await.unwrap();
        put(&service, &source, "docs/notes.txt", &token, &mut out)
            .await
            .unwrap();
        assert!(output(out).contains("Uploaded docs/notes.txt (17 bytes)"));

        let mut out: Vec<u8> = Vec::new();
        list(&service, None, None, &token, &mut out).await.unwrap();
        assert!(output(out).contains("[DIR]  docs/"));

        let mut out: Vec<u8> = Vec::new();
        list(&service, Some("docs"), Some("*.txt"), &token, &mut out)
            .await
            .unwrap();
        assert!(output(out).contains("[FILE] notes.txt (17 bytes)"));

        let target = dir.path().join("copy.txt");
        let mut out: Vec<u8> = Vec::new();
        get(&service, "docs/notes.txt", &target, None, &token, &mut out)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"remember the milk");

        let partial = dir.path().join("part.txt");
        get(
            &service,
            "docs/notes.txt",
            &partial,
            Some(parse_range("9-11").unwrap()),
            &token,
            &mut Vec::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&partial).unwrap(), b"the");

        remove(&service, "docs/notes.txt", false, &token, &mut Vec::new())
            .await
            .unwrap();
        let mut out: Vec<u8> = Vec::new();
        list(&service, Some("docs"), None, &token, &mut out)
            .await
            .unwrap();
        assert!(output(out).contains("No entries."));
    }

    #[tokio::test]
    async fn test_info_and_publish() {
        let service = MemoryService::new();
        let token = CancellationToken::new();
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.bin");
        std::fs::write(&source, [1u8; 32]).unwrap();
        put(&service, &source, "a.bin", &token, &mut Vec::new())
            .await
            .unwrap();

        let mut out: Vec<u8> = Vec::new();
        show_info(&service, "a.bin", false, &token, &mut out)
            .await
            .unwrap();
        let text = output(out);
        assert!(text.contains("Entry: a.bin"));
        assert!(text.contains("Size: 32 bytes"));
        assert!(text.contains("Provider: memory"));

        let mut out: Vec<u8> = Vec::new();
        publish(&service, "a.bin", false, None, &token, &mut out)
            .await
            .unwrap();
        let url = output(out).trim().to_string();
        assert!(service.resolve_public(&url).is_ok());

        unpublish(&service, "a.bin", false, &token, &mut Vec::new())
            .await
            .unwrap();
        assert!(service.resolve_public(&url).is_err());
    }

    #[tokio::test]
    async fn test_missing_entry_reports_path() {
        let service = MemoryService::new();
        let err = show_info(
            &service,
            "nope.txt",
            false,
            &CancellationToken::new(),
            &mut Vec::new(),
        )
        .await
        .unwrap_err();
        assert!(format!("{:#}", err).contains("nope.txt"));
    }

    #[tokio::test]
    async fn test_put_missing_local_file() {
        let service = MemoryService::new();
        let dir = tempfile::tempdir().unwrap();
        let err = put(
            &service,
            &dir.path().join("absent"),
            "x",
            &CancellationToken::new(),
            &mut Vec::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Failed to open"));
    }
}
