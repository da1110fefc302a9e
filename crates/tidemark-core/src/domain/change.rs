//! Change records flowing through the engine
//!
//! A raw [`Notification`] comes from the OS watcher. The debounce queue turns
//! notifications into [`PendingChange`]s, the resolver arranges fired changes
//! into [`DispatchUnit`] trees, and [`RemoteChange`]s travel the opposite way
//! from the sync engine back onto the disk.

use std::fmt::{self, Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::entry::EntryMetadata;
use super::errors::DomainError;
use super::newtypes::{ChangeId, LocalPath, PathCase};

// ============================================================================
// Kinds and origins
// ============================================================================

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Modified => "Modified",
            Self::Deleted => "Deleted",
            Self::Renamed => "Renamed",
        };
        f.write_str(name)
    }
}

/// Which collection a change entered the resolver from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// Freshly fired from the debounce queue
    #[default]
    Local,
    /// Failed earlier and dispatched again
    Retry,
    /// Already handed to the sync engine and still running
    InFlight,
}

// ============================================================================
// Notification
// ============================================================================

/// A raw notification from the OS watcher
///
/// The kind is only a hint. The debounce queue re-checks the disk and derives
/// the effective kind itself, except for renames where `old_path` is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: ChangeKind,
    pub path: LocalPath,
    pub old_path: Option<LocalPath>,
    pub is_directory_hint: bool,
}

impl Notification {
    #[must_use]
    pub fn new(kind: ChangeKind, path: LocalPath) -> Self {
        Self {
            kind,
            path,
            old_path: None,
            is_directory_hint: false,
        }
    }

    #[must_use]
    pub fn renamed(old_path: LocalPath, path: LocalPath) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            path,
            old_path: Some(old_path),
            is_directory_hint: false,
        }
    }

    #[must_use]
    pub fn directory(mut self, is_directory: bool) -> Self {
        self.is_directory_hint = is_directory;
        self
    }
}

// ============================================================================
// PendingChange
// ============================================================================

/// Debounce state of a pending change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelayState {
    /// When the change fires; `None` once fired or before the first arm
    pub deadline: Option<Instant>,
    /// How many times the deadline was pushed back
    pub resets: u32,
}

/// A change awaiting dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub id: ChangeId,
    pub kind: ChangeKind,
    pub path: LocalPath,
    /// Source path, only for `Renamed`
    pub old_path: Option<LocalPath>,
    pub metadata: EntryMetadata,
    pub delay: DelayState,
    pub dependencies: Vec<ChangeId>,
    pub origin: ChangeOrigin,
    /// Whether the event log holds a record for this change
    pub persisted: bool,
}

impl PendingChange {
    #[must_use]
    pub fn new(id: ChangeId, kind: ChangeKind, path: LocalPath, metadata: EntryMetadata) -> Self {
        Self {
            id,
            kind,
            path,
            old_path: None,
            metadata,
            delay: DelayState::default(),
            dependencies: Vec::new(),
            origin: ChangeOrigin::Local,
            persisted: false,
        }
    }

    #[must_use]
    pub fn renamed(
        id: ChangeId,
        old_path: LocalPath,
        path: LocalPath,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            old_path: Some(old_path),
            ..Self::new(id, ChangeKind::Renamed, path, metadata)
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: ChangeOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.origin == ChangeOrigin::InFlight
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.metadata.is_folder
    }

    /// Whether the debounce delay is armed
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.delay.deadline.is_some()
    }

    /// Every path the change refers to: the target, then the rename source
    pub fn paths(&self) -> impl Iterator<Item = &LocalPath> {
        std::iter::once(&self.path).chain(self.old_path.iter())
    }

    /// Whether any referenced path lies at or under `root`
    #[must_use]
    pub fn touches(&self, root: &LocalPath, case: PathCase) -> bool {
        self.paths().any(|path| root.contains(path, case))
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        match (self.kind, &self.old_path) {
            (ChangeKind::Renamed, None) => Err(DomainError::MalformedChange {
                kind: self.kind.to_string(),
                reason: "missing old path".into(),
            }),
            (ChangeKind::Renamed, Some(_)) => Ok(()),
            (_, Some(_)) => Err(DomainError::MalformedChange {
                kind: self.kind.to_string(),
                reason: "old path is only valid for renames".into(),
            }),
            (_, None) => Ok(()),
        }
    }
}

impl Display for PendingChange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.old_path {
            Some(old) => write!(f, "{} {} {} -> {}", self.id, self.kind, old, self.path),
            None => write!(f, "{} {} {}", self.id, self.kind, self.path),
        }
    }
}

// ============================================================================
// DispatchUnit
// ============================================================================

/// A change together with everything that must complete before it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchUnit {
    pub change: PendingChange,
    pub dependencies: Vec<DispatchUnit>,
}

impl DispatchUnit {
    #[must_use]
    pub fn leaf(change: PendingChange) -> Self {
        Self {
            change,
            dependencies: Vec::new(),
        }
    }

    /// Changes in the order they must be applied, dependencies first
    #[must_use]
    pub fn execution_order(&self) -> Vec<&PendingChange> {
        let mut order = Vec::new();
        self.collect_post_order(&mut order);
        order
    }

    fn collect_post_order<'a>(&'a self, out: &mut Vec<&'a PendingChange>) {
        for dependency in &self.dependencies {
            dependency.collect_post_order(out);
        }
        out.push(&self.change);
    }

    /// Number of changes in the tree
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.dependencies.iter().map(DispatchUnit::len).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[must_use]
    pub fn contains(&self, id: ChangeId) -> bool {
        self.change.id == id || self.dependencies.iter().any(|unit| unit.contains(id))
    }
}

// ============================================================================
// RemoteChange
// ============================================================================

/// A change originating from the server, to be applied to the local disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub path: LocalPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<LocalPath>,
    /// What the entry should look like once applied
    pub expected: EntryMetadata,
}

impl RemoteChange {
    #[must_use]
    pub fn created(path: LocalPath, expected: EntryMetadata) -> Self {
        Self {
            kind: ChangeKind::Created,
            path,
            old_path: None,
            expected,
        }
    }

    #[must_use]
    pub fn deleted(path: LocalPath, expected: EntryMetadata) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            path,
            old_path: None,
            expected,
        }
    }

    #[must_use]
    pub fn renamed(old_path: LocalPath, path: LocalPath, expected: EntryMetadata) -> Self {
        Self {
            kind: ChangeKind::Renamed,
            path,
            old_path: Some(old_path),
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn change(id: u64, kind: ChangeKind, path: &str) -> PendingChange {
        PendingChange::new(
            ChangeId::new(id),
            kind,
            LocalPath::new(path).unwrap(),
            EntryMetadata::file(1, at(0), at(0)),
        )
    }

    #[test]
    fn test_renamed_change_references_both_paths() {
        let rename = PendingChange::renamed(
            ChangeId::new(1),
            LocalPath::new("old/a.txt").unwrap(),
            LocalPath::new("new/a.txt").unwrap(),
            EntryMetadata::file(1, at(0), at(0)),
        );
        let paths: Vec<_> = rename.paths().map(LocalPath::as_str).collect();
        assert_eq!(paths, vec!["new/a.txt", "old/a.txt"]);
        assert!(rename.touches(&LocalPath::new("old").unwrap(), PathCase::Sensitive));
        assert!(!rename.touches(&LocalPath::new("other").unwrap(), PathCase::Sensitive));
        assert!(rename.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_rename_without_source() {
        let broken = change(1, ChangeKind::Renamed, "a");
        assert!(broken.validate().is_err());

        let mut created = change(2, ChangeKind::Created, "a");
        created.old_path = Some(LocalPath::new("b").unwrap());
        assert!(created.validate().is_err());
    }

    #[test]
    fn test_execution_order_runs_dependencies_first() {
        let folder = DispatchUnit::leaf(change(1, ChangeKind::Created, "a"));
        let unit = DispatchUnit {
            change: change(2, ChangeKind::Created, "a/b.txt"),
            dependencies: vec![folder],
        };
        let order: Vec<_> = unit.execution_order().iter().map(|c| c.id.get()).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(unit.len(), 2);
        assert!(unit.contains(ChangeId::new(1)));
        assert!(!unit.contains(ChangeId::new(3)));
    }

    #[test]
    fn test_display_includes_rename_source() {
        let rename = PendingChange::renamed(
            ChangeId::new(4),
            LocalPath::new("a").unwrap(),
            LocalPath::new("b").unwrap(),
            EntryMetadata::folder(at(0), at(0)),
        );
        assert_eq!(rename.to_string(), "#4 Renamed /a -> /b");
    }
}
