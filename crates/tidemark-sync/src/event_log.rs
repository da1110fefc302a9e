//! In-memory event log
//!
//! An [`IEventLog`] that keeps records in dispatch order inside the process.
//! Writes go to a staged copy while a transaction is open and replace the
//! committed records on commit.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tidemark_core::domain::ChangeId;
use tidemark_core::ports::{IEventLog, LogError, LoggedChange};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Retracted ids remembered individually; older ones collapse into a watermark
const RETRACTED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
struct Records {
    changes: Vec<LoggedChange>,
    retracted: BTreeSet<ChangeId>,
    /// Highest retracted id no longer held in `retracted`
    watermark: Option<ChangeId>,
}

impl Records {
    fn position(&self, id: ChangeId) -> Result<usize, LogError> {
        self.changes
            .iter()
            .position(|record| record.id == id)
            .ok_or(LogError::NotFound(id))
    }

    fn remember_retracted(&mut self, id: ChangeId) {
        self.retracted.insert(id);
        while self.retracted.len() > RETRACTED_CAPACITY {
            let Some(oldest) = self.retracted.pop_first() else {
                break;
            };
            self.watermark = self.watermark.max(Some(oldest));
        }
    }

    fn was_retracted(&self, id: ChangeId) -> bool {
        self.retracted.contains(&id) || self.watermark.is_some_and(|mark| id <= mark)
    }
}

#[derive(Debug, Default)]
struct LogState {
    committed: Records,
    staged: Option<Records>,
}

impl LogState {
    /// Records the next write applies to
    fn records(&mut self) -> &mut Records {
        match &mut self.staged {
            Some(staged) => staged,
            None => &mut self.committed,
        }
    }
}

/// Event log held in memory
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    state: Mutex<LogState>,
}

impl MemoryEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed records in order
    pub async fn entries(&self) -> Vec<LoggedChange> {
        self.state.lock().await.committed.changes.clone()
    }

    pub async fn contains(&self, id: ChangeId) -> bool {
        self.state
            .lock()
            .await
            .committed
            .changes
            .iter()
            .any(|record| record.id == id)
    }
}

#[async_trait]
impl IEventLog for MemoryEventLog {
    async fn begin_transaction(&self) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        if state.staged.is_some() {
            return Err(LogError::TransactionOpen);
        }
        state.staged = Some(state.committed.clone());
        trace!("transaction opened");
        Ok(())
    }

    async fn commit(&self) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        let staged = state.staged.take().ok_or(LogError::NoTransaction)?;
        debug!(records = staged.changes.len(), "transaction committed");
        state.committed = staged;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        state.staged.take().ok_or(LogError::NoTransaction)?;
        debug!("transaction rolled back");
        Ok(())
    }

    async fn merge_changes(&self, batch: &[LoggedChange]) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        let records = state.records();
        for record in batch {
            records.retracted.remove(&record.id);
            match records.changes.iter_mut().find(|existing| existing.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => records.changes.push(record.clone()),
            }
        }
        trace!(records = batch.len(), "changes merged");
        Ok(())
    }

    async fn swap_order(&self, first: ChangeId, second: ChangeId) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        let records = state.records();
        let a = records.position(first)?;
        let b = records.position(second)?;
        records.changes.swap(a, b);
        trace!(first = %first, second = %second, "records swapped");
        Ok(())
    }

    async fn retract(&self, id: ChangeId) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        let records = state.records();
        match records.position(id) {
            Ok(index) => {
                records.changes.remove(index);
                records.remember_retracted(id);
                trace!(id = %id, "record retracted");
                Ok(())
            }
            Err(_) if records.was_retracted(id) => Err(LogError::AlreadyRemoved(id)),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tidemark_core::domain::ChangeKind;

    use super::*;
    use crate::testing::path;

    fn record(id: u64, p: &str) -> LoggedChange {
        LoggedChange {
            id: ChangeId::new(id),
            kind: ChangeKind::Created,
            path: path(p),
            old_path: None,
            dependencies: Vec::new(),
        }
    }

    fn ids(records: &[LoggedChange]) -> Vec<u64> {
        records.iter().map(|r| r.id.get()).collect()
    }

    #[tokio::test]
    async fn test_transaction_is_invisible_until_commit() {
        let log = MemoryEventLog::new();
        log.begin_transaction().await.unwrap();
        log.merge_changes(&[record(1, "a"), record(2, "b")]).await.unwrap();
        assert!(log.entries().await.is_empty());

        log.commit().await.unwrap();
        assert_eq!(ids(&log.entries().await), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let log = MemoryEventLog::new();
        log.merge_changes(&[record(1, "a")]).await.unwrap();
        log.begin_transaction().await.unwrap();
        log.retract(ChangeId::new(1)).await.unwrap();
        log.rollback().await.unwrap();
        assert!(log.contains(ChangeId::new(1)).await);
    }

    #[tokio::test]
    async fn test_nested_transaction_is_rejected() {
        let log = MemoryEventLog::new();
        log.begin_transaction().await.unwrap();
        assert!(matches!(log.begin_transaction().await, Err(LogError::TransactionOpen)));
        assert!(matches!(MemoryEventLog::new().commit().await, Err(LogError::NoTransaction)));
    }

    #[tokio::test]
    async fn test_merge_replaces_existing_record_in_place() {
        let log = MemoryEventLog::new();
        log.merge_changes(&[record(1, "a"), record(2, "b")]).await.unwrap();
        log.merge_changes(&[record(1, "renamed")]).await.unwrap();

        let entries = log.entries().await;
        assert_eq!(ids(&entries), vec![1, 2]);
        assert_eq!(entries[0].path, path("renamed"));
    }

    #[tokio::test]
    async fn test_swap_order_exchanges_positions() {
        let log = MemoryEventLog::new();
        log.merge_changes(&[record(1, "a"), record(2, "b"), record(3, "c")]).await.unwrap();
        log.swap_order(ChangeId::new(1), ChangeId::new(3)).await.unwrap();
        assert_eq!(ids(&log.entries().await), vec![3, 2, 1]);

        assert!(matches!(
            log.swap_order(ChangeId::new(1), ChangeId::new(9)).await,
            Err(LogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_second_retraction_reports_already_removed() {
        let log = MemoryEventLog::new();
        log.merge_changes(&[record(1, "a")]).await.unwrap();
        log.retract(ChangeId::new(1)).await.unwrap();

        let err = log.retract(ChangeId::new(1)).await.unwrap_err();
        assert!(err.is_benign());
        assert!(matches!(log.retract(ChangeId::new(5)).await, Err(LogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rolled_back_retraction_is_forgotten() {
        let log = MemoryEventLog::new();
        log.merge_changes(&[record(1, "a")]).await.unwrap();
        log.begin_transaction().await.unwrap();
        log.retract(ChangeId::new(1)).await.unwrap();
        log.rollback().await.unwrap();

        log.retract(ChangeId::new(1)).await.unwrap();
        log.begin_transaction().await.unwrap();
        log.merge_changes(&[record(2, "b")]).await.unwrap();
        log.retract(ChangeId::new(2)).await.unwrap();
        log.rollback().await.unwrap();
        assert!(matches!(log.retract(ChangeId::new(2)).await, Err(LogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retracted_ids_stay_bounded() {
        let log = MemoryEventLog::new();
        let total = RETRACTED_CAPACITY as u64 + 10;
        let batch: Vec<_> = (1..=total).map(|id| record(id, "x")).collect();
        log.merge_changes(&batch).await.unwrap();
        for id in 1..=total {
            log.retract(ChangeId::new(id)).await.unwrap();
        }

        {
            let state = log.state.lock().await;
            assert_eq!(state.committed.retracted.len(), RETRACTED_CAPACITY);
            assert_eq!(state.committed.watermark, Some(ChangeId::new(10)));
        }
        // Old and recent retractions are both still recognised
        assert!(log.retract(ChangeId::new(3)).await.unwrap_err().is_benign());
        assert!(log.retract(ChangeId::new(total)).await.unwrap_err().is_benign());
    }
}
