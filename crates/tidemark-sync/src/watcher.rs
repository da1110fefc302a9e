//! File watching
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate to monitor the
//! watched root, converting raw OS events into root-relative
//! [`Notification`] values.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue / FSEvents
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  WatchEngine::run  ──→  DebounceQueue
//! ```
//!
//! The notify callback runs on the backend's own thread; the channel
//! serializes everything into the single engine worker in arrival order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tidemark_core::domain::{ChangeKind, LocalPath, Notification};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::filesystem::is_backup;

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches the root recursively using the OS-native mechanism
///
/// On Linux this uses inotify. Dropping the watcher stops all watches.
pub struct FileWatcher {
    /// The underlying notify watcher instance
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Creates a watcher for `root` and the receiver its notifications arrive on
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new(root: &Path, capacity: usize) -> Result<(Self, mpsc::Receiver<Notification>)> {
        let (tx, rx) = mpsc::channel::<Notification>(capacity);
        let root = root.to_path_buf();
        let callback_root = root.clone();

        info!(root = %root.display(), capacity, "Initializing file watcher");

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(notification) = map_notify_event(&callback_root, &event) {
                        if let Err(e) = tx.blocking_send(notification) {
                            warn!(error = %e, "Failed to send notification (receiver dropped)");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher, root }, rx))
    }

    /// Starts watching the root recursively
    ///
    /// # Errors
    /// Returns an error if the root cannot be watched (e.g., does not exist,
    /// insufficient permissions, or inotify watch limit reached)
    pub fn watch(&mut self) -> Result<()> {
        info!(path = %self.root.display(), "Starting recursive watch");

        self.watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", self.root.display()))
    }

    /// Stops watching the root
    pub fn unwatch(&mut self) -> Result<()> {
        info!(path = %self.root.display(), "Stopping watch");

        self.watcher
            .unwatch(&self.root)
            .with_context(|| format!("Failed to unwatch path: {}", self.root.display()))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

// ============================================================================
// Event mapping - notify::Event → Notification
// ============================================================================

/// Converts a path reported by notify into a root-relative path
///
/// The root itself, paths outside it and applier backups are ignored.
fn relative(root: &Path, path: &Path) -> Option<LocalPath> {
    if is_backup(path) {
        return None;
    }
    match LocalPath::from_absolute(root, path) {
        Ok(local) if !local.is_root() => Some(local),
        Ok(_) => None,
        Err(e) => {
            trace!(path = %path.display(), error = %e, "Ignoring path outside root");
            None
        }
    }
}

/// Converts a `notify::Event` into a [`Notification`]
///
/// Maps the notify event kinds as follows:
/// - `Create(*)` -> `Created` (folder hint from `CreateKind::Folder`)
/// - `Remove(*)` -> `Deleted` (folder hint from `RemoveKind::Folder`)
/// - `Modify(Name(Both))` with 2 paths -> `Renamed`
/// - `Modify(Name(From))` -> `Deleted`, `Modify(Name(To))` -> `Created`
/// - Other `Modify(*)` and `Any` -> `Modified`
///
/// The kind is a hint only; the debounce queue re-checks the disk.
fn map_notify_event(root: &Path, event: &notify::Event) -> Option<Notification> {
    let paths = &event.paths;

    let notification = match &event.kind {
        EventKind::Create(kind) => {
            let path = relative(root, paths.first()?)?;
            Notification::new(ChangeKind::Created, path).directory(*kind == CreateKind::Folder)
        }

        EventKind::Remove(kind) => {
            let path = relative(root, paths.first()?)?;
            Notification::new(ChangeKind::Deleted, path).directory(*kind == RemoveKind::Folder)
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            match (relative(root, &paths[0]), relative(root, &paths[1])) {
                (Some(old), Some(new)) => Notification::renamed(old, new),
                // Moved in from outside the root
                (None, Some(new)) => Notification::new(ChangeKind::Created, new),
                // Moved out of the root
                (Some(old), None) => Notification::new(ChangeKind::Deleted, old),
                (None, None) => return None,
            }
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Notification::new(ChangeKind::Deleted, relative(root, paths.first()?)?)
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            Notification::new(ChangeKind::Created, relative(root, paths.first()?)?)
        }

        EventKind::Modify(_) | EventKind::Any => {
            Notification::new(ChangeKind::Modified, relative(root, paths.first()?)?)
        }

        // Ignore access events and other event types
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };

    debug!(
        kind = %notification.kind,
        path = %notification.path,
        dir = notification.is_directory_hint,
        "Mapped notify event"
    );
    Some(notification)
}

// ============================================================================
// Unit tests
// ============================================================================
