//! Metadata probe port
//!
//! The debounce queue re-checks the disk for every notification it receives.
//! The probe is synchronous because it is called with the state lock held and
//! must stay a single `stat`.

use crate::domain::{EntryMetadata, LocalPath};

/// Reads on-disk metadata for a root-relative path
pub trait IMetadataProbe: Send + Sync {
    /// Current metadata of `path`
    ///
    /// Returns `Ok(None)` when nothing exists at the path. Other failures
    /// (permissions, I/O) are errors; callers skip the observation.
    fn probe(&self, path: &LocalPath) -> anyhow::Result<Option<EntryMetadata>>;
}
