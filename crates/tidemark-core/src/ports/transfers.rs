//! In-flight transfer port
//!
//! The sync engine exposes the uploads and downloads it is currently running
//! so the remote-change applier can pause them, and redirect or cancel them,
//! when it moves or deletes the paths they target.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{LocalPath, PathCase, TransferId};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Where a transfer reads from or writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferTarget {
    Path(LocalPath),
    /// The target was deleted; the transfer must abandon its work
    Cancelled,
}

impl TransferTarget {
    #[must_use]
    pub fn path(&self) -> Option<&LocalPath> {
        match self {
            Self::Path(path) => Some(path),
            Self::Cancelled => None,
        }
    }
}

impl Display for TransferTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{path}"),
            Self::Cancelled => f.write_str("<cancelled>"),
        }
    }
}

/// Held while a transfer is paused; dropping it lets the transfer resume
pub type PauseGuard = Box<dyn Send>;

/// Handle on one running transfer
#[async_trait]
pub trait ITransferHandle: Send + Sync {
    fn id(&self) -> TransferId;

    fn direction(&self) -> TransferDirection;

    fn target(&self) -> TransferTarget;

    fn set_target(&self, target: TransferTarget);

    /// Wait until the transfer reaches a safe point and hold it there
    async fn pause(&self) -> PauseGuard;
}

/// Lookup of running transfers
pub trait ITransferRegistry: Send + Sync {
    /// Transfers whose target lies at or under `root`
    fn in_flight_under(&self, root: &LocalPath, case: PathCase) -> Vec<Arc<dyn ITransferHandle>>;
}
