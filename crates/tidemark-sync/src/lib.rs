//! Tidemark Sync - Local change detection and reconciliation
//!
//! Provides:
//! - An in-memory index of every known path
//! - A debounce queue that folds noisy OS notifications into coherent changes
//! - A dependency resolver that orders overlapping changes before dispatch
//! - A remote-change applier that writes server changes without echoing them
//!
//! ## Modules
//!
//! - [`index`] - Path index and folder creation-time index
//! - [`queue`] - Debounce queue, transition table and rename inference
//! - [`resolver`] - Dependency resolver producing dispatch trees
//! - [`applier`] - Remote-change applier
//! - [`engine`] - Pipeline tying watcher, queue, resolver and sink together
//! - [`watcher`] - `notify` adapter feeding the engine
//! - [`filesystem`] - Disk probe and move/delete helpers
//! - [`transfers`] - In-memory in-flight transfer table
//! - [`event_log`] - In-memory event log
//! - [`sink`] - Channel-backed change sink
//! - [`reporter`] - `tracing`-backed event reporter

pub mod applier;
pub mod engine;
pub mod event_log;
pub mod filesystem;
pub mod index;
pub mod queue;
pub mod reporter;
pub mod resolver;
pub mod sink;
pub mod transfers;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

use thiserror::Error;
use tidemark_core::domain::{ChangeId, ChangeKind, DomainError, LocalPath};
use tidemark_core::ports::LogError;

/// Errors raised while applying a remote change to the local disk
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Neither the source nor a matching target exists
    #[error("Source missing: {0}")]
    SourceMissing(LocalPath),

    /// Something that is not a folder occupies a folder path
    #[error("Not a folder: {0}")]
    NotAFolder(LocalPath),

    /// The applier only handles folder creations, deletions and renames
    #[error("Unsupported remote {kind} for {path}")]
    Unsupported {
        /// Kind of the rejected change
        kind: ChangeKind,
        /// Target path of the rejected change
        path: LocalPath,
    },

    /// A filesystem operation failed
    #[error("IO error on {path}: {source}")]
    Io {
        /// Absolute path of the failed operation
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A domain-level error propagated from tidemark-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

impl ApplyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the engine pipeline
#[derive(Debug, Error)]
pub enum EngineError {
    /// The event log could not reorder records; the log no longer reflects
    /// dispatch order and the pipeline stops
    #[error("Event log ordering corrupted while swapping {first} and {second}: {source}")]
    OrderingCorrupted {
        first: ChangeId,
        second: ChangeId,
        #[source]
        source: LogError,
    },

    /// A previous fatal error stopped the pipeline
    #[error("Engine halted")]
    Halted,

    /// Applying a remote change failed
    #[error(transparent)]
    Apply(#[from] ApplyError),
}
