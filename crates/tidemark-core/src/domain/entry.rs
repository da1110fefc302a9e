//! Index entries and their metadata
//!
//! [`EntryMetadata`] is what the index remembers about a path and what a
//! probe of the local disk returns. [`HashableMetadata`] is the subset used to
//! decide whether two observations describe the same content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{LocalPath, RemoteId};

/// Server identity and revision of an entry, opaque to this crate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    pub id: RemoteId,
    pub revision: String,
}

/// Metadata snapshot of a file or folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub is_folder: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Byte size, `None` for folders
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteIdentity>,
}

impl EntryMetadata {
    #[must_use]
    pub fn file(size: u64, created: DateTime<Utc>, modified: DateTime<Utc>) -> Self {
        Self {
            is_folder: false,
            created,
            modified,
            size: Some(size),
            remote: None,
        }
    }

    #[must_use]
    pub fn folder(created: DateTime<Utc>, modified: DateTime<Utc>) -> Self {
        Self {
            is_folder: true,
            created,
            modified,
            size: None,
            remote: None,
        }
    }

    #[must_use]
    pub fn with_remote(mut self, remote: Option<RemoteIdentity>) -> Self {
        self.remote = remote;
        self
    }

    #[must_use]
    pub fn hashable(&self) -> HashableMetadata {
        HashableMetadata {
            is_folder: self.is_folder,
            created: self.created,
            modified: self.modified,
            size: self.size,
        }
    }

    /// Same type, times and size; remote identity is ignored
    #[must_use]
    pub fn same_shape(&self, other: &EntryMetadata) -> bool {
        self.hashable() == other.hashable()
    }
}

/// Comparison key for rename inference and change detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashableMetadata {
    pub is_folder: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: Option<u64>,
}

/// One live entry of the path index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathEntry {
    pub path: LocalPath,
    pub metadata: EntryMetadata,
}

impl PathEntry {
    #[must_use]
    pub fn new(path: LocalPath, metadata: EntryMetadata) -> Self {
        Self { path, metadata }
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.metadata.is_folder
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_same_shape_ignores_remote_identity() {
        let local = EntryMetadata::file(10, at(0), at(5));
        let synced = local.clone().with_remote(Some(RemoteIdentity {
            id: RemoteId::new("ABC").unwrap(),
            revision: "3".into(),
        }));
        assert!(local.same_shape(&synced));
        assert_ne!(local, synced);
    }

    #[test]
    fn test_modified_time_changes_shape() {
        let before = EntryMetadata::file(10, at(0), at(5));
        let after = EntryMetadata::file(10, at(0), at(6));
        assert!(!before.same_shape(&after));
    }

    #[test]
    fn test_folder_has_no_size() {
        let folder = EntryMetadata::folder(at(0), at(0));
        assert!(folder.is_folder);
        assert_eq!(folder.size, None);
        assert!(PathEntry::new(LocalPath::new("d").unwrap(), folder).is_folder());
    }
}
