//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`IMetadataProbe`] with `std::fs` and provides the disk
//! operations used by the remote-change applier and bootstrap.
//!
//! ## Design Decisions
//!
//! - **No follow**: Metadata is read with `symlink_metadata`, so a symlink is
//!   reported as itself and never as its target.
//! - **Creation time**: Falls back to the modification time on filesystems
//!   that do not record birth time.
//! - **Replace with backup**: A file rename onto an existing file first moves
//!   the target aside, so a failed move can be rolled back.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tidemark_core::domain::{EntryMetadata, LocalPath};
use tidemark_core::ports::IMetadataProbe;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Suffix of the temporary copy kept while a file is replaced
pub const BACKUP_SUFFIX: &str = ".tidemark-bak";

// ============================================================================
// Metadata probe
// ============================================================================

/// Probe that reads metadata below a watched root
#[derive(Debug, Clone)]
pub struct LocalMetadataProbe {
    root: PathBuf,
}

impl LocalMetadataProbe {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl IMetadataProbe for LocalMetadataProbe {
    fn probe(&self, path: &LocalPath) -> anyhow::Result<Option<EntryMetadata>> {
        let absolute = path.to_absolute(&self.root);
        match std::fs::symlink_metadata(&absolute) {
            Ok(metadata) => Ok(Some(metadata_from_std(&metadata))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", absolute.display())),
        }
    }
}

/// Convert `std` metadata into the engine's comparable form
#[must_use]
pub fn metadata_from_std(metadata: &std::fs::Metadata) -> EntryMetadata {
    let modified = metadata
        .modified()
        .map(system_time_to_utc)
        .unwrap_or_default();
    let created = metadata.created().map(system_time_to_utc).unwrap_or(modified);

    if metadata.is_dir() {
        EntryMetadata::folder(created, modified)
    } else {
        EntryMetadata::file(metadata.len(), created, modified)
    }
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

// ============================================================================
// Disk operations
// ============================================================================

/// Set the modification time of a file or folder
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn set_modified(path: &Path, when: DateTime<Utc>) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let time = SystemTime::from(when);
    tokio::task::spawn_blocking(move || std::fs::File::open(&path)?.set_modified(time))
        .await
        .map_err(std::io::Error::other)?
}

/// Remove a file or a whole folder; a missing path is not an error
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("already gone");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Move a file onto `to`, replacing whatever is there
///
/// An existing target is first moved to a backup next to it and removed
/// after the move succeeded. If no backup can be taken the target is
/// deleted and the file moved in its place.
#[instrument(skip_all, fields(from = %from.display(), to = %to.display()))]
pub async fn replace_file(from: &Path, to: &Path) -> std::io::Result<()> {
    let backup = backup_path(to);
    let has_backup = match tokio::fs::rename(to, &backup).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            debug!(error = %e, "backup failed, falling back to delete and move");
            remove_path(to).await?;
            return tokio::fs::rename(from, to).await;
        }
    };

    match tokio::fs::rename(from, to).await {
        Ok(()) => {
            if has_backup {
                if let Err(e) = remove_path(&backup).await {
                    warn!(backup = %backup.display(), error = %e, "Failed to remove backup");
                }
            }
            Ok(())
        }
        Err(e) => {
            if has_backup {
                if let Err(restore) = tokio::fs::rename(&backup, to).await {
                    warn!(backup = %backup.display(), error = %restore, "Failed to restore backup");
                }
            }
            Err(e)
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

/// Whether `path` is a backup left by [`replace_file`]
#[must_use]
pub fn is_backup(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(BACKUP_SUFFIX))
}

/// Walk the tree below `root` and collect the metadata of every entry
///
/// Unreadable entries are skipped with a warning.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn scan_tree(root: &Path) -> anyhow::Result<Vec<(LocalPath, EntryMetadata)>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut snapshot = Vec::new();
        for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if is_backup(entry.path()) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping entry without metadata");
                    continue;
                }
            };
            match LocalPath::from_absolute(&root, entry.path()) {
                Ok(path) => snapshot.push((path, metadata_from_std(&metadata))),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unsupported path"),
            }
        }
        debug!(entries = snapshot.len(), "tree scanned");
        Ok(snapshot)
    })
    .await
    .context("Tree scan task failed")?
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testing::{at, path};

    #[test]
    fn test_probe_reports_files_folders_and_absence() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"twelve bytes").unwrap();
        let probe = LocalMetadataProbe::new(dir.path());

        let file = probe.probe(&path("sub/a.txt")).unwrap().unwrap();
        assert!(!file.is_folder);
        assert_eq!(file.size, Some(12));

        let folder = probe.probe(&path("sub")).unwrap().unwrap();
        assert!(folder.is_folder);
        assert_eq!(folder.size, None);

        assert!(probe.probe(&path("missing")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_path_handles_folders_and_missing_paths() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("d");
        std::fs::create_dir_all(sub.join("e")).unwrap();
        std::fs::write(sub.join("e/f.txt"), b"x").unwrap();

        remove_path(&sub).await.unwrap();
        assert!(!sub.exists());
        remove_path(&sub).await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_file_overwrites_and_cleans_backup() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("new.txt");
        let to = dir.path().join("old.txt");
        std::fs::write(&from, b"fresh").unwrap();
        std::fs::write(&to, b"stale").unwrap();

        replace_file(&from, &to).await.unwrap();

        assert_eq!(std::fs::read(&to).unwrap(), b"fresh");
        assert!(!from.exists());
        assert!(!backup_path(&to).exists());
    }

    #[tokio::test]
    async fn test_replace_file_restores_target_when_source_missing() {
        let dir = TempDir::new().unwrap();
        let from = dir.path().join("gone.txt");
        let to = dir.path().join("kept.txt");
        std::fs::write(&to, b"keep me").unwrap();

        assert!(replace_file(&from, &to).await.is_err());
        assert_eq!(std::fs::read(&to).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_set_modified_is_visible_to_probe() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        set_modified(&dir.path().join("a.txt"), at(42)).await.unwrap();

        let probe = LocalMetadataProbe::new(dir.path());
        let metadata = probe.probe(&path("a.txt")).unwrap().unwrap();
        assert_eq!(metadata.modified, at(42));
    }

    #[tokio::test]
    async fn test_scan_tree_lists_relative_paths_without_backups() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/c.txt"), b"c").unwrap();
        std::fs::write(dir.path().join("x.txt.tidemark-bak"), b"old").unwrap();

        let mut paths: Vec<String> = scan_tree(dir.path())
            .await
            .unwrap()
            .into_iter()
            .map(|(p, _)| p.as_str().to_string())
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c.txt"]);
    }
}
