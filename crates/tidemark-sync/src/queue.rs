//! Debounce queue
//!
//! Folds the notification storm of the OS watcher into one pending change per
//! path. Every notification re-checks the disk, compares it with the path
//! index and merges the result into the pending change for that path using
//! [`transition`]. A change fires once it has been quiet for the configured
//! delay; fired changes collect in a batch that is handed out after the batch
//! window or when it is full.
//!
//! The queue is a plain data structure driven by explicit `now` instants. It
//! always runs next to the [`PathIndex`] under the engine's state lock, and it
//! keeps the index up to date as it goes, so the next notification for a path
//! is compared against what was last seen rather than what was last synced.
//!
//! Renames are recovered in three ways:
//! - the OS reports both paths, handled by [`DebounceQueue::submit`] directly;
//! - a delete and a create with the same metadata meet in the queue;
//! - a folder shows up with the creation time of a folder that vanished.

use std::collections::HashMap;
use std::time::Instant;

use tidemark_core::config::DebounceSettings;
use tidemark_core::domain::{
    ChangeId, ChangeKind, EntryMetadata, LocalPath, Notification, PathCase, PathEntry,
    PendingChange,
};
use tidemark_core::ports::IMetadataProbe;
use tracing::{debug, error, info, trace, warn};

use crate::index::{IndexObserver, PathIndex};

// ============================================================================
// Transition table
// ============================================================================

/// Outcome of a notification meeting a pending change for the same path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Keep one pending change, now of this kind, with the incoming metadata
    Become(ChangeKind),
    /// The two changes undo each other
    Cancel,
    /// Fire the existing change unchanged and start a new one
    FireAndStart(ChangeKind),
    /// Fire the existing change relabelled, then start a new one
    FireAsAndStart {
        fired: ChangeKind,
        start: ChangeKind,
    },
    /// Renamed then modified: Modified at the target, Deleted at the source
    SplitRename,
    /// Renamed then deleted: a single Deleted at the source
    CollapseToSource,
    /// Cannot happen while index and queue agree
    Invalid,
}

/// The 4×4 merge table, existing kind × incoming kind
///
/// `is_folder` is true when either side describes a folder; `identical`
/// compares the hashable metadata of both sides.
#[must_use]
pub fn transition(
    existing: ChangeKind,
    incoming: ChangeKind,
    is_folder: bool,
    identical: bool,
) -> Transition {
    use ChangeKind::{Created, Deleted, Modified, Renamed};

    match (existing, incoming) {
        (Created, Created | Modified) => Transition::Become(Created),
        (Created, Deleted) if !is_folder && identical => Transition::Cancel,
        // Folders stay paired so a later create can still be matched as a rename.
        (Created, Deleted) => Transition::FireAndStart(Deleted),
        (Created, Renamed) => Transition::Become(Renamed),

        (Modified, Created) => Transition::Invalid,
        (Modified, Modified) => Transition::Become(Modified),
        (Modified, Deleted) => Transition::Become(Deleted),
        (Modified, Renamed) => Transition::FireAsAndStart {
            fired: Deleted,
            start: Renamed,
        },

        (Deleted, Created) if is_folder => Transition::FireAndStart(Created),
        (Deleted, Created) if identical => Transition::Cancel,
        (Deleted, Created) => Transition::Become(Modified),
        (Deleted, Modified | Deleted) => Transition::Become(Deleted),
        (Deleted, Renamed) => Transition::FireAndStart(Renamed),

        (Renamed, Created) => Transition::Invalid,
        (Renamed, Modified) => Transition::SplitRename,
        (Renamed, Deleted) => Transition::CollapseToSource,
        (Renamed, Renamed) => Transition::FireAndStart(Renamed),
    }
}

// ============================================================================
// Observations
// ============================================================================

/// Effective kind of a notification after comparing index and disk
#[derive(Debug, Clone)]
enum Observed {
    Created(EntryMetadata),
    Modified(EntryMetadata),
    Deleted(EntryMetadata),
}

impl Observed {
    fn derive(known: Option<&EntryMetadata>, disk: Option<EntryMetadata>) -> Option<Self> {
        match (known, disk) {
            (None, Some(disk)) => Some(Self::Created(disk)),
            (Some(known), None) => Some(Self::Deleted(known.clone())),
            (Some(known), Some(disk)) if !known.same_shape(&disk) => {
                Some(Self::Modified(carry_remote(disk, known)))
            }
            _ => None,
        }
    }

    fn kind(&self) -> ChangeKind {
        match self {
            Self::Created(_) => ChangeKind::Created,
            Self::Modified(_) => ChangeKind::Modified,
            Self::Deleted(_) => ChangeKind::Deleted,
        }
    }

    fn metadata(&self) -> &EntryMetadata {
        match self {
            Self::Created(m) | Self::Modified(m) | Self::Deleted(m) => m,
        }
    }

    fn into_metadata(self) -> EntryMetadata {
        match self {
            Self::Created(m) | Self::Modified(m) | Self::Deleted(m) => m,
        }
    }
}

fn carry_remote(metadata: EntryMetadata, from: &EntryMetadata) -> EntryMetadata {
    if metadata.remote.is_some() {
        metadata
    } else {
        metadata.with_remote(from.remote.clone())
    }
}

/// Whether two observations plausibly describe the same entry
///
/// Folder times move whenever children change, so folders are matched by
/// creation time alone.
fn same_entry(a: &EntryMetadata, b: &EntryMetadata) -> bool {
    if a.is_folder && b.is_folder {
        a.created == b.created
    } else {
        a.same_shape(b)
    }
}

// ============================================================================
// DebounceQueue
// ============================================================================

/// Pending changes, at most one per folded path, plus the fired batch
#[derive(Debug)]
pub struct DebounceQueue {
    settings: DebounceSettings,
    case: PathCase,
    now: Instant,
    last_id: u64,
    pending: HashMap<String, PendingChange>,
    /// Folder deletions whose index entries stay until the change fires
    retained: HashMap<String, ChangeId>,
    batch: Vec<PendingChange>,
    batch_opened: Option<Instant>,
}

impl DebounceQueue {
    #[must_use]
    pub fn new(settings: DebounceSettings, case: PathCase) -> Self {
        Self {
            settings,
            case,
            now: Instant::now(),
            last_id: 0,
            pending: HashMap::new(),
            retained: HashMap::new(),
            batch: Vec::new(),
            batch_opened: None,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &DebounceSettings {
        &self.settings
    }

    /// The unfired change for `path`, if any
    #[must_use]
    pub fn pending(&self, path: &LocalPath) -> Option<&PendingChange> {
        self.pending.get(&path.key(self.case))
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Make sure future ids sort after `id`
    pub fn reserve_id(&mut self, id: ChangeId) {
        self.last_id = self.last_id.max(id.get());
    }

    /// Queue changes carried over from a previous run straight into the batch
    pub fn enqueue_carried(&mut self, changes: Vec<PendingChange>, now: Instant) {
        self.now = now;
        for mut change in changes {
            self.reserve_id(change.id);
            change.delay.deadline = None;
            self.push_batch(change);
        }
    }

    /// Earliest instant at which `fire_due` or `take_batch` has work
    #[must_use]
    pub fn next_wakeup(&self) -> Option<Instant> {
        let batch_due = self.batch_opened.map(|opened| {
            if self.batch.len() >= self.settings.batch_limit {
                opened
            } else {
                opened + self.settings.batch_window
            }
        });
        self.pending
            .values()
            .filter_map(|change| change.delay.deadline)
            .chain(batch_due)
            .min()
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Fold one OS notification into the queue
    pub fn submit(
        &mut self,
        index: &mut PathIndex,
        notification: Notification,
        probe: &dyn IMetadataProbe,
        now: Instant,
    ) {
        self.now = now;
        trace!(
            kind = %notification.kind,
            path = %notification.path,
            dir = notification.is_directory_hint,
            "Notification received"
        );

        let Notification {
            kind,
            path,
            old_path,
            ..
        } = notification;
        match old_path {
            // A case-only rename still respells the entry under folded keys.
            Some(old) if kind == ChangeKind::Renamed && old != path => {
                self.submit_rename(index, old, path, probe);
            }
            _ => self.observe_path(index, &path, probe),
        }
    }

    fn probe(probe: &dyn IMetadataProbe, path: &LocalPath) -> Result<Option<EntryMetadata>, ()> {
        probe.probe(path).map_err(|err| {
            warn!(path = %path, error = %err, "Could not read metadata, notification skipped");
        })
    }

    fn observe_path(&mut self, index: &mut PathIndex, path: &LocalPath, probe: &dyn IMetadataProbe) {
        if path.is_root() {
            return;
        }
        let Ok(disk) = Self::probe(probe, path) else {
            return;
        };
        self.observe(index, path, disk, probe);
    }

    fn observe(
        &mut self,
        index: &mut PathIndex,
        path: &LocalPath,
        disk: Option<EntryMetadata>,
        probe: &dyn IMetadataProbe,
    ) {
        let key = path.key(self.case);
        let existing = self.pending.remove(&key);
        let known = match &existing {
            Some(change) if change.kind == ChangeKind::Deleted => None,
            _ => index.get(path).map(|entry| entry.metadata.clone()),
        };

        // A file replaced by a folder (or the reverse) is a delete and a create.
        let type_changed = matches!(
            (&known, &disk),
            (Some(known), Some(current)) if known.is_folder != current.is_folder
        );
        if type_changed {
            if let Some(change) = existing {
                self.pending.insert(key, change);
            }
            self.observe(index, path, None, probe);
            self.observe(index, path, disk, probe);
            return;
        }

        match (existing, Observed::derive(known.as_ref(), disk)) {
            (None, None) => {}
            (Some(existing), None) => self.arm(index, existing),
            (None, Some(observed)) => self.start(index, path, observed, probe),
            (Some(existing), Some(observed)) => self.merge(index, existing, observed),
        }
    }

    fn start(
        &mut self,
        index: &mut PathIndex,
        path: &LocalPath,
        observed: Observed,
        probe: &dyn IMetadataProbe,
    ) {
        match observed {
            Observed::Created(metadata) => {
                if let Some((source, deletion)) = self.find_rename_source(index, path, &metadata, probe) {
                    self.rename_from_deletion(index, source, deletion, path, metadata);
                    return;
                }
                index.set(path, Some(metadata.clone()), &mut ());
                let change = PendingChange::new(self.allocate_id(), ChangeKind::Created, path.clone(), metadata);
                self.arm(index, change);
            }
            Observed::Modified(metadata) => {
                index.set(path, Some(metadata.clone()), &mut ());
                let change = PendingChange::new(self.allocate_id(), ChangeKind::Modified, path.clone(), metadata);
                self.arm(index, change);
            }
            Observed::Deleted(metadata) => {
                if let Some(creation) = self.find_rename_target(path, &metadata) {
                    self.rename_onto_creation(index, path, metadata, creation);
                    return;
                }
                let change = PendingChange::new(self.allocate_id(), ChangeKind::Deleted, path.clone(), metadata);
                self.record_deletion(index, &change);
                self.arm(index, change);
            }
        }
    }

    fn merge(&mut self, index: &mut PathIndex, mut existing: PendingChange, observed: Observed) {
        let key = existing.path.key(self.case);
        let path = existing.path.clone();
        let incoming = observed.kind();
        let is_folder = existing.is_folder() || observed.metadata().is_folder;
        let identical = existing.metadata.same_shape(observed.metadata());
        let outcome = transition(existing.kind, incoming, is_folder, identical);
        debug!(
            id = %existing.id,
            path = %path,
            existing = %existing.kind,
            incoming = %incoming,
            outcome = ?outcome,
            "Merging notification into pending change"
        );

        if let Observed::Created(metadata) | Observed::Modified(metadata) = &observed {
            // Whatever a retained folder deletion still holds is gone now.
            if self.retained.get(&key) == Some(&existing.id) {
                self.retained.remove(&key);
                index.remove(&path, self);
            }
            index.set(&path, Some(metadata.clone()), &mut ());
        }

        match outcome {
            Transition::Become(kind) => {
                let metadata = carry_remote(observed.into_metadata(), &existing.metadata);
                existing.kind = kind;
                existing.metadata = metadata;
                if kind == ChangeKind::Deleted && incoming == ChangeKind::Deleted {
                    self.record_deletion(index, &existing);
                }
                self.arm(index, existing);
            }
            Transition::Cancel => {
                if incoming == ChangeKind::Deleted {
                    index.remove(&path, self);
                }
                debug!(id = %existing.id, path = %path, "Changes cancelled out");
            }
            Transition::FireAndStart(kind) => {
                let metadata = carry_remote(observed.into_metadata(), &existing.metadata);
                self.fire(index, existing);
                let change = PendingChange::new(self.allocate_id(), kind, path, metadata);
                if kind == ChangeKind::Deleted {
                    self.record_deletion(index, &change);
                }
                self.arm(index, change);
            }
            Transition::SplitRename => {
                let previous = existing.metadata.clone();
                let source = existing.old_path.take();
                existing.kind = ChangeKind::Modified;
                existing.metadata = carry_remote(observed.into_metadata(), &previous);
                match source {
                    Some(source) => {
                        let deleted = PendingChange::new(self.allocate_id(), ChangeKind::Deleted, source, previous);
                        self.fire(index, deleted);
                    }
                    None => error!(id = %existing.id, "Renamed change without a source path"),
                }
                self.arm(index, existing);
            }
            Transition::CollapseToSource => {
                index.remove(&path, self);
                let Some(source) = existing.old_path.take() else {
                    error!(id = %existing.id, "Renamed change without a source path");
                    return;
                };
                existing.kind = ChangeKind::Deleted;
                existing.path = source;
                if self.pending.contains_key(&existing.path.key(self.case)) {
                    // Something new already lives at the source.
                    self.fire(index, existing);
                } else {
                    self.arm(index, existing);
                }
            }
            Transition::FireAsAndStart { .. } | Transition::Invalid => {
                error!(
                    id = %existing.id,
                    path = %path,
                    existing = %existing.kind,
                    incoming = %incoming,
                    "Invalid pending change transition; index and queue disagree"
                );
                existing.metadata = carry_remote(observed.into_metadata(), &existing.metadata);
                self.arm(index, existing);
            }
        }
    }

    fn submit_rename(
        &mut self,
        index: &mut PathIndex,
        old: LocalPath,
        new: LocalPath,
        probe: &dyn IMetadataProbe,
    ) {
        let Ok(disk) = Self::probe(probe, &new) else {
            return;
        };
        let old_key = old.key(self.case);
        let new_key = new.key(self.case);

        let away = self.pending.remove(&old_key);
        let known_old = match &away {
            Some(change) if change.kind == ChangeKind::Deleted => None,
            _ => index.get(&old).map(|entry| entry.metadata.clone()),
        };

        let (Some(disk), Some(known_old)) = (disk, known_old) else {
            // Either the target already vanished or the source was never
            // seen; both paths are judged on their own.
            if let Some(change) = away {
                self.pending.insert(old_key, change);
            }
            self.observe_path(index, &old, probe);
            self.observe_path(index, &new, probe);
            return;
        };
        if known_old.is_folder != disk.is_folder {
            if let Some(change) = away {
                self.pending.insert(old_key, change);
            }
            self.observe_path(index, &old, probe);
            self.observe_path(index, &new, probe);
            return;
        }

        let displaced = self.pending.remove(&new_key);
        self.retained.remove(&new_key);
        index.rename(&old, &new, self);
        let metadata = carry_remote(disk, &known_old);
        index.set(&new, Some(metadata.clone()), &mut ());

        let moved = match away {
            None => Some(PendingChange::renamed(self.allocate_id(), old, new.clone(), metadata)),
            Some(mut change) => match change.kind {
                ChangeKind::Created => {
                    change.path = new.clone();
                    change.metadata = metadata;
                    Some(change)
                }
                ChangeKind::Modified => {
                    self.fire(index, change);
                    Some(PendingChange::renamed(self.allocate_id(), old, new.clone(), metadata))
                }
                ChangeKind::Renamed => match change.old_path.clone() {
                    Some(source) if source.same(&new, self.case) => {
                        if change.metadata.same_shape(&metadata) {
                            debug!(id = %change.id, path = %new, "Renamed back to its origin, cancelled");
                            None
                        } else {
                            change.kind = ChangeKind::Modified;
                            change.old_path = None;
                            change.path = new.clone();
                            change.metadata = metadata;
                            Some(change)
                        }
                    }
                    _ => {
                        change.path = new.clone();
                        change.metadata = metadata;
                        Some(change)
                    }
                },
                ChangeKind::Deleted => {
                    error!(id = %change.id, path = %old, "Rename of a path with a pending deletion");
                    Some(PendingChange::renamed(self.allocate_id(), old, new.clone(), metadata))
                }
            },
        };

        if let Some(displaced) = displaced {
            self.displace(index, displaced);
        }
        if let Some(change) = moved {
            self.arm(index, change);
        }
    }

    /// Settle a pending change whose path was taken over by a rename
    fn displace(&mut self, index: &mut PathIndex, mut displaced: PendingChange) {
        match transition(displaced.kind, ChangeKind::Renamed, displaced.is_folder(), false) {
            Transition::Become(_) => {
                debug!(id = %displaced.id, path = %displaced.path, "Pending change overwritten by rename");
            }
            Transition::FireAsAndStart { fired, .. } => {
                displaced.kind = fired;
                displaced.old_path = None;
                self.fire(index, displaced);
            }
            Transition::FireAndStart(_) => self.fire(index, displaced),
            other => {
                error!(id = %displaced.id, outcome = ?other, "Unexpected outcome for displaced change");
                self.fire(index, displaced);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Rename inference
    // ------------------------------------------------------------------------

    /// A vanished entry that the created `metadata` could be a move of
    fn find_rename_source(
        &mut self,
        index: &PathIndex,
        path: &LocalPath,
        metadata: &EntryMetadata,
        probe: &dyn IMetadataProbe,
    ) -> Option<(LocalPath, Option<PendingChange>)> {
        let case = self.case;
        let deletion = self
            .pending
            .iter()
            .filter(|(_, change)| {
                change.kind == ChangeKind::Deleted
                    && same_entry(&change.metadata, metadata)
                    && !change.path.overlaps(path, case)
            })
            .max_by_key(|(_, change)| change.id)
            .map(|(key, _)| key.clone());
        if let Some(key) = deletion {
            let change = self.pending.remove(&key)?;
            return Some((change.path.clone(), Some(change)));
        }

        if !metadata.is_folder {
            return None;
        }
        let candidates: Vec<LocalPath> = index
            .find_folders_created_at(metadata.created)
            .into_iter()
            .map(|entry| entry.path.clone())
            .filter(|candidate| !candidate.overlaps(path, case))
            .filter(|candidate| !self.pending.contains_key(&candidate.key(case)))
            .collect();
        candidates
            .into_iter()
            .find(|candidate| matches!(probe.probe(candidate), Ok(None)))
            .map(|candidate| (candidate, None))
    }

    /// A pending creation that the deleted `metadata` could have moved to
    fn find_rename_target(&mut self, path: &LocalPath, metadata: &EntryMetadata) -> Option<PendingChange> {
        let case = self.case;
        let key = self
            .pending
            .iter()
            .filter(|(_, change)| {
                change.kind == ChangeKind::Created
                    && same_entry(&change.metadata, metadata)
                    && !change.path.overlaps(path, case)
            })
            .max_by_key(|(_, change)| change.id)
            .map(|(key, _)| key.clone())?;
        self.pending.remove(&key)
    }

    fn rename_from_deletion(
        &mut self,
        index: &mut PathIndex,
        source: LocalPath,
        deletion: Option<PendingChange>,
        path: &LocalPath,
        metadata: EntryMetadata,
    ) {
        let remote = deletion
            .as_ref()
            .and_then(|change| change.metadata.remote.clone())
            .or_else(|| index.get(&source).and_then(|entry| entry.metadata.remote.clone()));
        self.retained.remove(&source.key(self.case));
        index.rename(&source, path, self);
        let metadata = metadata.with_remote(remote);
        index.set(path, Some(metadata.clone()), &mut ());

        let id = match &deletion {
            Some(change) => change.id,
            None => self.allocate_id(),
        };
        info!(id = %id, from = %source, to = %path, "Inferred rename from delete and create");
        self.arm(index, PendingChange::renamed(id, source, path.clone(), metadata));
    }

    fn rename_onto_creation(
        &mut self,
        index: &mut PathIndex,
        source: &LocalPath,
        metadata: EntryMetadata,
        creation: PendingChange,
    ) {
        let target = creation.path.clone();
        if metadata.is_folder {
            index.rename(source, &target, self);
        } else {
            index.remove(source, self);
        }
        let merged = carry_remote(creation.metadata, &metadata);
        index.set(&target, Some(merged.clone()), &mut ());

        info!(id = %creation.id, from = %source, to = %target, "Inferred rename from create and delete");
        self.arm(index, PendingChange::renamed(creation.id, source.clone(), target, merged));
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Fire every change whose delay has elapsed
    pub fn fire_due(&mut self, index: &mut PathIndex, now: Instant) -> usize {
        self.now = now;
        let mut due: Vec<(ChangeId, String)> = self
            .pending
            .iter()
            .filter(|(_, change)| change.delay.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(key, change)| (change.id, key.clone()))
            .collect();
        due.sort();

        let mut fired = 0;
        for (_, key) in due {
            // Firing a folder deletion may have disposed later entries.
            if let Some(change) = self.pending.remove(&key) {
                self.fire(index, change);
                fired += 1;
            }
        }
        fired
    }

    /// Fire everything still pending, regardless of deadlines
    pub fn fire_all(&mut self, index: &mut PathIndex, now: Instant) -> usize {
        self.now = now;
        let mut all: Vec<(ChangeId, String)> = self
            .pending
            .iter()
            .map(|(key, change)| (change.id, key.clone()))
            .collect();
        all.sort();

        let mut fired = 0;
        for (_, key) in all {
            if let Some(change) = self.pending.remove(&key) {
                self.fire(index, change);
                fired += 1;
            }
        }
        fired
    }

    /// Hand out the batch once its window has elapsed or it is full
    pub fn take_batch(&mut self, now: Instant) -> Option<Vec<PendingChange>> {
        self.now = now;
        let opened = self.batch_opened?;
        let ready = self.batch.len() >= self.settings.batch_limit
            || now >= opened + self.settings.batch_window;
        if !ready {
            return None;
        }
        Some(self.drain_batch())
    }

    /// Hand out the batch immediately
    pub fn drain_batch(&mut self) -> Vec<PendingChange> {
        self.batch_opened = None;
        let mut batch = std::mem::take(&mut self.batch);
        batch.sort_by_key(|change| change.id);
        batch
    }

    /// Adjust unfired changes after the server deleted `root`
    ///
    /// A local move out of the deleted subtree can no longer be replayed as a
    /// rename, so it becomes a creation at its target.
    pub fn on_remote_delete(&mut self, root: &LocalPath) {
        let case = self.case;
        for change in self.pending.values_mut() {
            let moved_out = change.kind == ChangeKind::Renamed
                && change.old_path.as_ref().is_some_and(|source| root.contains(source, case))
                && !root.contains(&change.path, case);
            if moved_out {
                debug!(id = %change.id, path = %change.path, "Source deleted remotely, rename becomes creation");
                change.kind = ChangeKind::Created;
                change.old_path = None;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn allocate_id(&mut self) -> ChangeId {
        self.last_id += 1;
        ChangeId::new(self.last_id)
    }

    /// (Re)start the delay of `change` and store it as the pending change
    fn arm(&mut self, index: &mut PathIndex, mut change: PendingChange) {
        let mut extend = true;
        if change.is_armed() {
            if change.delay.resets >= self.settings.max_resets {
                // Keeps merging, but the deadline no longer moves.
                trace!(id = %change.id, "Reset cap reached");
                extend = false;
            } else {
                change.delay.resets += 1;
            }
        }
        if extend {
            change.delay.deadline = Some(self.now + self.settings.delay);
        }

        let key = change.path.key(self.case);
        if let Some(previous) = self.pending.insert(key, change) {
            error!(id = %previous.id, path = %previous.path, "Two pending changes for one path; firing the older");
            self.fire(index, previous);
        }
    }

    fn record_deletion(&mut self, index: &mut PathIndex, change: &PendingChange) {
        if change.is_folder() {
            self.retained.insert(change.path.key(self.case), change.id);
        } else {
            index.remove(&change.path, self);
        }
    }

    fn fire(&mut self, index: &mut PathIndex, mut change: PendingChange) {
        change.delay.deadline = None;
        if change.kind == ChangeKind::Deleted {
            let key = change.path.key(self.case);
            if self.retained.get(&key) == Some(&change.id) {
                self.retained.remove(&key);
                index.remove(&change.path, self);
            }
        }
        trace!(change = %change, "Change fired");
        self.push_batch(change);
    }

    fn push_batch(&mut self, change: PendingChange) {
        if self.batch.is_empty() {
            self.batch_opened = Some(self.now);
        }
        self.batch.push(change);
    }

    fn keys_touching(&self, root: &LocalPath) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, change)| change.touches(root, self.case))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Store a re-keyed change; an occupant of the new key fires
    fn store_rekeyed(&mut self, change: PendingChange) {
        let key = change.path.key(self.case);
        if let Some(occupant) = self.pending.insert(key, change) {
            debug!(id = %occupant.id, path = %occupant.path, "Pending change displaced by re-keyed change");
            self.push_batch(occupant);
        }
    }
}

impl IndexObserver for DebounceQueue {
    fn on_removed(&mut self, path: &LocalPath, _removed: &[PathEntry]) {
        let case = self.case;
        for key in self.keys_touching(path) {
            let Some(mut change) = self.pending.remove(&key) else {
                continue;
            };
            self.retained.remove(&key);

            if !path.contains(&change.path, case) {
                // Only the rename source was inside; the change still stands.
                self.pending.insert(key, change);
                continue;
            }

            let source_outside = change
                .old_path
                .as_ref()
                .is_some_and(|source| !path.contains(source, case));
            if change.kind == ChangeKind::Renamed && source_outside {
                if let Some(source) = change.old_path.take() {
                    debug!(id = %change.id, path = %source, "Renamed into removed subtree, now a deletion");
                    change.kind = ChangeKind::Deleted;
                    change.path = source;
                    self.store_rekeyed(change);
                }
            } else {
                debug!(id = %change.id, path = %change.path, "Pending change disposed with its subtree");
            }
        }
    }

    fn on_renamed(&mut self, old: &LocalPath, new: &LocalPath) {
        let case = self.case;
        for key in self.keys_touching(old) {
            let Some(mut change) = self.pending.remove(&key) else {
                continue;
            };
            let retained = self.retained.remove(&key);

            if let Some(path) = change.path.rebase(old, new, case) {
                change.path = path;
            }
            if let Some(source) = change.old_path.as_ref().and_then(|s| s.rebase(old, new, case)) {
                change.old_path = Some(source);
            }
            trace!(id = %change.id, path = %change.path, "Pending change follows rename");

            if let Some(id) = retained {
                self.retained.insert(change.path.key(case), id);
            }
            self.store_rekeyed(change);
        }
    }
}
