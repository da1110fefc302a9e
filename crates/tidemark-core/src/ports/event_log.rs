//! Event log port (driven/secondary port)
//!
//! The event log keeps a durable, ordered record of changes that were handed
//! to the sync engine and have not completed yet. Each dispatch pass writes
//! inside one transaction.
//!
//! ## Design Notes
//!
//! - Uses a dedicated `LogError` so callers can tell a benign double
//!   retraction from a real storage failure.
//! - Record order is dispatch order; `swap_order` repairs it when a change
//!   recorded earlier must now wait for one recorded later.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ChangeId, ChangeKind, DispatchUnit, LocalPath, PendingChange};

/// Errors raised by event log implementations
#[derive(Debug, Error)]
pub enum LogError {
    /// The record was already retracted
    #[error("change {0} was already removed from the event log")]
    AlreadyRemoved(ChangeId),

    /// No record with this id exists
    #[error("change {0} is not in the event log")]
    NotFound(ChangeId),

    /// A transaction is already open
    #[error("a transaction is already open")]
    TransactionOpen,

    /// Commit or rollback without an open transaction
    #[error("no open transaction")]
    NoTransaction,

    /// Storage backend failure
    #[error("event log storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl LogError {
    /// Races that leave the log in the intended state
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyRemoved(_))
    }
}

/// One record of the event log
///
/// A record describes a top-level change; `dependencies` lists the ids of
/// the changes folded underneath it, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedChange {
    pub id: ChangeId,
    pub kind: ChangeKind,
    pub path: LocalPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<LocalPath>,
    #[serde(default)]
    pub dependencies: Vec<ChangeId>,
}

impl From<&PendingChange> for LoggedChange {
    fn from(change: &PendingChange) -> Self {
        Self {
            id: change.id,
            kind: change.kind,
            path: change.path.clone(),
            old_path: change.old_path.clone(),
            dependencies: change.dependencies.clone(),
        }
    }
}

impl From<&DispatchUnit> for LoggedChange {
    fn from(unit: &DispatchUnit) -> Self {
        let mut record = Self::from(&unit.change);
        record.dependencies = unit
            .execution_order()
            .iter()
            .map(|change| change.id)
            .filter(|id| *id != unit.change.id)
            .collect();
        record
    }
}

/// Durable record of dispatched changes
#[async_trait]
pub trait IEventLog: Send + Sync {
    async fn begin_transaction(&self) -> Result<(), LogError>;

    async fn commit(&self) -> Result<(), LogError>;

    async fn rollback(&self) -> Result<(), LogError>;

    /// Insert new records and replace existing ones with the same id
    async fn merge_changes(&self, batch: &[LoggedChange]) -> Result<(), LogError>;

    /// Exchange the positions of two records
    async fn swap_order(&self, first: ChangeId, second: ChangeId) -> Result<(), LogError>;

    /// Remove a record
    async fn retract(&self, id: ChangeId) -> Result<(), LogError>;
}
