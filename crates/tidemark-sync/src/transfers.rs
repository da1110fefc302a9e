//! In-memory table of in-flight transfers
//!
//! Implements [`ITransferRegistry`] for the daemon and tests. An external
//! sync engine registers each upload or download here and calls
//! [`InFlightTransfer::checkpoint`] between chunks; the remote-change applier
//! pauses transfers by holding their gate.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tidemark_core::domain::{LocalPath, PathCase, TransferId};
use tidemark_core::ports::{
    ITransferHandle, ITransferRegistry, PauseGuard, TransferDirection, TransferTarget,
};
use tracing::debug;

/// One running upload or download
#[derive(Debug)]
pub struct InFlightTransfer {
    id: TransferId,
    direction: TransferDirection,
    target: Mutex<TransferTarget>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl InFlightTransfer {
    #[must_use]
    pub fn new(direction: TransferDirection, path: LocalPath) -> Self {
        Self {
            id: TransferId::new(),
            direction,
            target: Mutex::new(TransferTarget::Path(path)),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Wait while the transfer is paused, then report where to continue
    ///
    /// Returns `None` once the target was cancelled.
    pub async fn checkpoint(&self) -> Option<LocalPath> {
        let _gate = self.gate.lock().await;
        self.target().path().cloned()
    }
}

#[async_trait]
impl ITransferHandle for InFlightTransfer {
    fn id(&self) -> TransferId {
        self.id
    }

    fn direction(&self) -> TransferDirection {
        self.direction
    }

    fn target(&self) -> TransferTarget {
        self.target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_target(&self, target: TransferTarget) {
        debug!(transfer = %self.id, target = %target, "Transfer target updated");
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = target;
    }

    async fn pause(&self) -> PauseGuard {
        Box::new(Arc::clone(&self.gate).lock_owned().await)
    }
}

/// Transfers keyed by id
///
/// Uses DashMap so transfer workers can register and complete concurrently.
#[derive(Default)]
pub struct TransferTable {
    transfers: DashMap<TransferId, Arc<InFlightTransfer>>,
}

impl TransferTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a transfer
    pub fn register(&self, direction: TransferDirection, path: LocalPath) -> Arc<InFlightTransfer> {
        let transfer = Arc::new(InFlightTransfer::new(direction, path));
        self.transfers.insert(transfer.id, Arc::clone(&transfer));
        transfer
    }

    /// Stop tracking a finished transfer
    pub fn complete(&self, id: TransferId) -> Option<Arc<InFlightTransfer>> {
        self.transfers.remove(&id).map(|(_, transfer)| transfer)
    }

    #[must_use]
    pub fn get(&self, id: TransferId) -> Option<Arc<InFlightTransfer>> {
        self.transfers.get(&id).map(|r| Arc::clone(&r))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

impl ITransferRegistry for TransferTable {
    fn in_flight_under(&self, root: &LocalPath, case: PathCase) -> Vec<Arc<dyn ITransferHandle>> {
        self.transfers
            .iter()
            .filter(|r| {
                r.value()
                    .target()
                    .path()
                    .is_some_and(|path| root.contains(path, case))
            })
            .map(|r| Arc::clone(r.value()) as Arc<dyn ITransferHandle>)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::path;

    #[test]
    fn test_in_flight_under_matches_subtree_only() {
        let table = TransferTable::new();
        table.register(TransferDirection::Download, path("d/e.txt"));
        table.register(TransferDirection::Upload, path("dx.txt"));

        let found = table.in_flight_under(&path("d"), PathCase::Sensitive);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].target(), TransferTarget::Path(path("d/e.txt")));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_cancelled_transfer_is_no_longer_listed() {
        let table = TransferTable::new();
        let transfer = table.register(TransferDirection::Download, path("a.txt"));
        transfer.set_target(TransferTarget::Cancelled);
        assert!(table.in_flight_under(&LocalPath::root(), PathCase::Sensitive).is_empty());

        assert!(table.complete(transfer.id()).is_some());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_pause_to_end() {
        let table = TransferTable::new();
        let transfer = table.register(TransferDirection::Download, path("a.txt"));
        let guard = transfer.pause().await;

        let worker = Arc::clone(&transfer);
        let handle = tokio::spawn(async move { worker.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        transfer.set_target(TransferTarget::Path(path("b.txt")));
        drop(guard);
        assert_eq!(handle.await.unwrap(), Some(path("b.txt")));
    }
}
