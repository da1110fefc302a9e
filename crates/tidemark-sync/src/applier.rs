//! Remote-change applier
//!
//! Writes changes that came from the server onto the local disk. Every
//! operation runs under the engine's state lock and records its result in the
//! path index straight away, so the OS notification caused by the applier's
//! own write compares equal and never turns into a local change.
//!
//! Transfers touching the affected subtree are paused for the duration of a
//! delete or rename. Pauses are taken in transfer-id order and released in
//! reverse.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tidemark_core::domain::{
    ChangeKind, DomainError, EntryMetadata, LocalPath, PathCase, RemoteChange,
};
use tidemark_core::ports::{
    EngineEvent, IEventReporter, ITransferHandle, ITransferRegistry, PauseGuard, Severity,
    TransferTarget,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::WatchState;
use crate::filesystem::{self, metadata_from_std};
use crate::ApplyError;

type Paused = Vec<(Arc<dyn ITransferHandle>, PauseGuard)>;

/// Applies [`RemoteChange`]s to the local tree
pub struct RemoteChangeApplier {
    root: PathBuf,
    state: Arc<Mutex<WatchState>>,
    transfers: Arc<dyn ITransferRegistry>,
    reporter: Arc<dyn IEventReporter>,
}

impl RemoteChangeApplier {
    pub fn new(
        root: impl Into<PathBuf>,
        state: Arc<Mutex<WatchState>>,
        transfers: Arc<dyn ITransferRegistry>,
        reporter: Arc<dyn IEventReporter>,
    ) -> Self {
        Self {
            root: root.into(),
            state,
            transfers,
            reporter,
        }
    }

    /// Apply one remote change
    ///
    /// Failures are logged and published at [`Severity::Error`] before being
    /// returned; they are never retried here.
    #[instrument(skip(self, change), fields(kind = %change.kind, path = %change.path))]
    pub async fn apply(&self, change: &RemoteChange) -> Result<(), ApplyError> {
        let result = {
            let mut state = self.state.lock().await;
            match change.kind {
                ChangeKind::Created => self.apply_created(&mut state, change).await,
                ChangeKind::Deleted => self.apply_deleted(&mut state, change).await,
                ChangeKind::Renamed => self.apply_renamed(&mut state, change).await,
                ChangeKind::Modified => Err(ApplyError::Unsupported {
                    kind: change.kind,
                    path: change.path.clone(),
                }),
            }
        };

        match &result {
            Ok(()) => info!("Remote change applied"),
            Err(e) => {
                error!(error = %e, "Remote change failed");
                let event = EngineEvent::new(
                    Severity::Error,
                    "Remote change failed",
                    format!("{} {}: {}", change.kind, change.path, e),
                );
                if let Err(report_err) = self.reporter.report(&event).await {
                    warn!(error = %report_err, "Failed to publish engine event");
                }
            }
        }
        result
    }

    // ------------------------------------------------------------------------
    // Created
    // ------------------------------------------------------------------------

    async fn apply_created(
        &self,
        state: &mut WatchState,
        change: &RemoteChange,
    ) -> Result<(), ApplyError> {
        if !change.expected.is_folder {
            return Err(ApplyError::Unsupported {
                kind: change.kind,
                path: change.path.clone(),
            });
        }
        if change.path.is_root() {
            return Ok(());
        }

        let mut chain: Vec<LocalPath> = change
            .path
            .ancestors()
            .into_iter()
            .filter(|p| !p.is_root())
            .collect();
        chain.reverse();
        chain.push(change.path.clone());

        for folder in &chain {
            let absolute = folder.to_absolute(&self.root);
            match tokio::fs::create_dir(&absolute).await {
                Ok(()) => debug!(path = %folder, "folder created"),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let existing = read_metadata(&absolute).await?;
                    if !existing.is_some_and(|m| m.is_folder) {
                        return Err(ApplyError::NotAFolder(folder.clone()));
                    }
                }
                Err(e) => return Err(ApplyError::io(absolute, e)),
            }
        }

        let absolute = change.path.to_absolute(&self.root);
        if let Err(e) = filesystem::set_modified(&absolute, change.expected.modified).await {
            debug!(error = %e, "could not reconcile folder times");
        }

        // Ancestors first, so the echo of each mkdir compares equal.
        for folder in &chain {
            let absolute = folder.to_absolute(&self.root);
            let Some(actual) = read_metadata(&absolute).await? else {
                continue;
            };
            let actual = if folder == &change.path {
                actual.with_remote(change.expected.remote.clone())
            } else {
                match state.index.get(folder) {
                    Some(known) => actual.with_remote(known.metadata.remote.clone()),
                    None => actual,
                }
            };
            state.index.set(folder, Some(actual), &mut ());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Deleted
    // ------------------------------------------------------------------------

    async fn apply_deleted(
        &self,
        state: &mut WatchState,
        change: &RemoteChange,
    ) -> Result<(), ApplyError> {
        let path = &change.path;
        if path.is_root() {
            return Err(DomainError::InvalidPath("cannot delete the watch root".into()).into());
        }
        let case = state.index.case();
        let mut paused = self.pause_transfers(path, case).await;

        let absolute = path.to_absolute(&self.root);
        let result = filesystem::remove_path(&absolute)
            .await
            .map_err(|e| ApplyError::io(&absolute, e));

        if result.is_ok() {
            for (transfer, _) in &paused {
                info!(
                    transfer = %transfer.id(),
                    direction = ?transfer.direction(),
                    target = %transfer.target(),
                    "Transfer cancelled by remote delete"
                );
                transfer.set_target(TransferTarget::Cancelled);
            }
            let WatchState { index, queue, .. } = state;
            queue.on_remote_delete(path);
            index.remove(path, queue);
        }

        release(&mut paused);
        result
    }

    // ------------------------------------------------------------------------
    // Renamed
    // ------------------------------------------------------------------------

    async fn apply_renamed(
        &self,
        state: &mut WatchState,
        change: &RemoteChange,
    ) -> Result<(), ApplyError> {
        let Some(old) = change.old_path.clone() else {
            return Err(DomainError::MalformedChange {
                kind: change.kind.to_string(),
                reason: "missing old path".into(),
            }
            .into());
        };
        let new = change.path.clone();
        let case = state.index.case();

        let expected = state
            .index
            .get(&old)
            .or_else(|| state.index.get(&new))
            .map(|entry| entry.metadata.clone())
            .unwrap_or_else(|| change.expected.clone());
        let remote = change.expected.remote.clone().or(expected.remote.clone());

        let from = old.to_absolute(&self.root);
        let to = new.to_absolute(&self.root);

        let Some(source) = read_metadata(&from).await? else {
            let target = read_metadata(&to).await?;
            return match target {
                Some(actual) if matches_expected(&actual, &expected) => {
                    debug!("rename already applied");
                    let WatchState { index, queue, .. } = state;
                    index.rename(&old, &new, queue);
                    index.set(&new, Some(actual.with_remote(remote)), &mut ());
                    Ok(())
                }
                _ => Err(ApplyError::SourceMissing(old)),
            };
        };

        let mut paused = self.pause_transfers(&old, case).await;
        let moved = if source.is_folder {
            tokio::fs::rename(&from, &to).await
        } else {
            filesystem::replace_file(&from, &to).await
        };

        let result = match moved {
            Ok(()) => Ok(()),
            Err(e) => {
                // Someone else already moved it into place.
                let source_gone = matches!(read_metadata(&from).await, Ok(None));
                let target = read_metadata(&to).await.ok().flatten();
                if source_gone && target.is_some_and(|t| matches_expected(&t, &expected)) {
                    debug!(error = %e, "rename error treated as success");
                    Ok(())
                } else {
                    Err(ApplyError::io(&to, e))
                }
            }
        };

        if result.is_ok() {
            for (transfer, _) in &paused {
                let moved_target = transfer
                    .target()
                    .path()
                    .and_then(|path| path.rebase(&old, &new, case));
                if let Some(path) = moved_target {
                    debug!(transfer = %transfer.id(), direction = ?transfer.direction(), target = %path, "transfer retargeted");
                    transfer.set_target(TransferTarget::Path(path));
                }
            }

            let WatchState { index, queue, .. } = state;
            index.rename(&old, &new, queue);
            if let Some(actual) = read_metadata(&to).await? {
                index.set(&new, Some(actual.with_remote(remote)), &mut ());
            }
        }

        release(&mut paused);
        result
    }

    // ------------------------------------------------------------------------

    async fn pause_transfers(&self, root: &LocalPath, case: PathCase) -> Paused {
        let mut handles = self.transfers.in_flight_under(root, case);
        handles.sort_by_key(|handle| handle.id());

        let mut paused = Vec::with_capacity(handles.len());
        for handle in handles {
            let guard = handle.pause().await;
            debug!(transfer = %handle.id(), "transfer paused");
            paused.push((handle, guard));
        }
        paused
    }
}

/// Drop pause guards, last acquired first
fn release(paused: &mut Paused) {
    while let Some((handle, guard)) = paused.pop() {
        drop(guard);
        debug!(transfer = %handle.id(), "transfer resumed");
    }
}

/// Whether the entry on disk already looks like the expected result
fn matches_expected(actual: &EntryMetadata, expected: &EntryMetadata) -> bool {
    actual.is_folder == expected.is_folder
        && actual.size == expected.size
        && (actual.is_folder || actual.modified == expected.modified)
}

async fn read_metadata(path: &Path) -> Result<Option<EntryMetadata>, ApplyError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata_from_std(&metadata))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ApplyError::io(path, e)),
    }
}
