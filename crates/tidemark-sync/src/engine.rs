//! Watch engine - the local change pipeline
//!
//! The [`WatchEngine`] owns the single lock guarding the path index and the
//! debounce queue, and drives a change from OS notification to dispatch.
//!
//! ## Flow
//!
//! ```text
//! FileWatcher ──→ mpsc::Receiver ──→ WatchEngine::run
//!                                        │
//!                     DebounceQueue ─→ batch ─→ DependencyResolver
//!                                                    │
//!                                   IEventLog (one transaction per pass)
//!                                                    │
//!                                               IChangeSink
//! ```
//!
//! Each dispatch pass resolves the fired batch together with the retry list
//! and every change still in flight, so new changes can be ordered after the
//! work the sync engine is already doing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tidemark_core::config::DebounceSettings;
use tidemark_core::domain::{
    ChangeId, ChangeOrigin, DispatchUnit, EntryMetadata, LocalPath, Notification, PathCase,
    PendingChange, RemoteChange,
};
use tidemark_core::ports::{
    EngineEvent, IChangeSink, IEventLog, IEventReporter, IMetadataProbe, ITransferRegistry,
    LogError, LoggedChange, Severity,
};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::applier::RemoteChangeApplier;
use crate::index::PathIndex;
use crate::queue::DebounceQueue;
use crate::resolver::{DependencyResolver, Resolution};
use crate::EngineError;

// ============================================================================
// WatchState
// ============================================================================

/// Everything guarded by the engine lock
#[derive(Debug)]
pub struct WatchState {
    pub index: PathIndex,
    pub queue: DebounceQueue,
    /// Dispatched changes that have not completed yet
    pub in_flight: BTreeMap<ChangeId, PendingChange>,
    /// Members of every dispatched unit, keyed by the unit's root
    pub dispatched: BTreeMap<ChangeId, Vec<ChangeId>>,
    /// Changes dispatched again with the next batch
    pub failed: BTreeMap<ChangeId, PendingChange>,
}

impl WatchState {
    #[must_use]
    pub fn new(settings: DebounceSettings, case: PathCase) -> Self {
        Self {
            index: PathIndex::new(case),
            queue: DebounceQueue::new(settings, case),
            in_flight: BTreeMap::new(),
            dispatched: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Stop tracking the unit rooted at `root` and return its changes
    fn settle(&mut self, root: ChangeId) -> Vec<PendingChange> {
        let members = self.dispatched.remove(&root).unwrap_or_else(|| vec![root]);
        members
            .into_iter()
            .filter_map(|id| self.in_flight.remove(&id))
            .collect()
    }
}

// ============================================================================
// Ports and reports
// ============================================================================

/// Adapters the engine talks to
pub struct EnginePorts {
    pub probe: Arc<dyn IMetadataProbe>,
    pub event_log: Arc<dyn IEventLog>,
    pub sink: Arc<dyn IChangeSink>,
    pub transfers: Arc<dyn ITransferRegistry>,
    pub reporter: Arc<dyn IEventReporter>,
}

/// Summary of one dispatch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Dependency trees handed to the sink
    pub units: usize,
    /// Changes inside those trees that were not already in flight
    pub changes: usize,
    pub dropped: usize,
    pub absorbed: usize,
    /// Non-fatal failures (event log, sink)
    pub errors: Vec<String>,
}

impl DispatchReport {
    fn record_error(&mut self, operation: &str, error: &dyn std::fmt::Display) {
        warn!(operation, error = %error, "Dispatch step failed");
        self.errors.push(format!("{operation}: {error}"));
    }
}

// ============================================================================
// WatchEngine
// ============================================================================

/// Debounces, resolves and dispatches local changes; applies remote ones
pub struct WatchEngine {
    state: Arc<Mutex<WatchState>>,
    resolver: DependencyResolver,
    applier: RemoteChangeApplier,
    probe: Arc<dyn IMetadataProbe>,
    event_log: Arc<dyn IEventLog>,
    sink: Arc<dyn IChangeSink>,
    reporter: Arc<dyn IEventReporter>,
    halted: AtomicBool,
}

impl WatchEngine {
    pub fn new(
        root: impl Into<PathBuf>,
        settings: DebounceSettings,
        case: PathCase,
        ports: EnginePorts,
    ) -> Self {
        let root = root.into();
        info!(root = %root.display(), case = ?case, "Creating watch engine");

        let state = Arc::new(Mutex::new(WatchState::new(settings, case)));
        let applier = RemoteChangeApplier::new(
            root,
            Arc::clone(&state),
            ports.transfers,
            Arc::clone(&ports.reporter),
        );
        Self {
            state,
            resolver: DependencyResolver::new(case),
            applier,
            probe: ports.probe,
            event_log: ports.event_log,
            sink: ports.sink,
            reporter: ports.reporter,
            halted: AtomicBool::new(false),
        }
    }

    /// Shared handle on the guarded state
    #[must_use]
    pub fn state(&self) -> Arc<Mutex<WatchState>> {
        Arc::clone(&self.state)
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Load the initial snapshot and the changes a previous run left in the
    /// event log
    ///
    /// Carried changes skip the debounce delay and go straight into the
    /// batch; they are treated as already persisted.
    pub async fn bootstrap(
        &self,
        snapshot: Vec<(LocalPath, EntryMetadata)>,
        carried: Vec<PendingChange>,
    ) {
        let mut state = self.state.lock().await;
        let entries = snapshot.len();
        state.index.load(snapshot);

        let carried: Vec<PendingChange> = carried
            .into_iter()
            .filter(|change| match change.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(change = %change, error = %e, "Carried change skipped");
                    false
                }
            })
            .map(|mut change| {
                change.persisted = true;
                change.with_origin(ChangeOrigin::Local)
            })
            .collect();
        let carried_len = carried.len();
        state.queue.enqueue_carried(carried, now());

        info!(entries, carried = carried_len, "Watch engine bootstrapped");
    }

    /// Fold one OS notification into the queue
    pub async fn submit(&self, notification: Notification) {
        let mut state = self.state.lock().await;
        let WatchState { index, queue, .. } = &mut *state;
        queue.submit(index, notification, self.probe.as_ref(), now());
    }

    /// When the next debounce deadline or batch window elapses
    pub async fn next_wakeup(&self) -> Option<tokio::time::Instant> {
        let state = self.state.lock().await;
        state.queue.next_wakeup().map(tokio::time::Instant::from_std)
    }

    /// Fire due changes and dispatch the batch once it is ready
    ///
    /// Returns `Ok(None)` when no batch was ready.
    ///
    /// # Errors
    /// [`EngineError::OrderingCorrupted`] when the event log could not be
    /// reordered; the engine halts and later calls return
    /// [`EngineError::Halted`].
    #[instrument(skip(self))]
    pub async fn dispatch_ready(&self) -> Result<Option<DispatchReport>, EngineError> {
        self.ensure_running()?;
        let now = now();
        let mut state = self.state.lock().await;
        let WatchState { index, queue, .. } = &mut *state;
        queue.fire_due(index, now);
        let Some(batch) = queue.take_batch(now) else {
            return Ok(None);
        };
        self.dispatch(state, batch).await.map(Some)
    }

    /// Fire everything pending and dispatch it together with the retry list,
    /// ignoring delays and the batch window
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<Option<DispatchReport>, EngineError> {
        self.ensure_running()?;
        let mut state = self.state.lock().await;
        let WatchState { index, queue, .. } = &mut *state;
        queue.fire_all(index, now());
        let batch = queue.drain_batch();
        if batch.is_empty() && state.failed.is_empty() {
            return Ok(None);
        }
        self.dispatch(state, batch).await.map(Some)
    }

    /// The sink finished the unit rooted at `id`
    ///
    /// Returns `false` when no such unit was in flight.
    #[instrument(skip(self))]
    pub async fn report_completed(&self, id: ChangeId) -> bool {
        let mut state = self.state.lock().await;
        let settled = state.settle(id);
        if settled.is_empty() {
            warn!(id = %id, "Completion reported for a change that is not in flight");
            return false;
        }

        match self.event_log.retract(id).await {
            Ok(()) => {}
            Err(e) if e.is_benign() => debug!(id = %id, error = %e, "Record already retracted"),
            Err(e) => self.log_failure("retract", Some(id), &e).await,
        }
        info!(id = %id, changes = settled.len(), "Unit completed");
        true
    }

    /// The sink gave up on the unit rooted at `id`; its changes are retried
    /// with the next batch
    #[instrument(skip(self))]
    pub async fn report_failed(&self, id: ChangeId, reason: &str) -> bool {
        let settled = {
            let mut state = self.state.lock().await;
            let settled = state.settle(id);
            for change in &settled {
                state.failed.insert(change.id, change.clone());
            }
            settled
        };
        if settled.is_empty() {
            warn!(id = %id, "Failure reported for a change that is not in flight");
            return false;
        }

        warn!(id = %id, changes = settled.len(), reason, "Unit failed, queued for retry");
        self.publish(
            EngineEvent::new(Severity::Warning, "Change failed", reason).for_change(id),
        )
        .await;
        true
    }

    /// Apply a change that came from the server
    pub async fn apply_remote(&self, change: &RemoteChange) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.applier.apply(change).await?;
        Ok(())
    }

    /// Main loop
    ///
    /// Submits notifications as they arrive and dispatches whenever the
    /// earliest deadline elapses. Stops when `cancel` fires or the channel
    /// closes, flushing whatever is still pending.
    pub async fn run(
        &self,
        mut notifications: mpsc::Receiver<Notification>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        {
            let state = self.state.lock().await;
            let settings = state.queue.settings();
            info!(
                delay_ms = settings.delay.as_millis() as u64,
                max_resets = settings.max_resets,
                batch_window_ms = settings.batch_window.as_millis() as u64,
                batch_limit = settings.batch_limit,
                "Watch engine starting"
            );
        }

        loop {
            let wakeup = self.next_wakeup().await;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Shutdown requested, watch engine stopping");
                    break;
                }

                received = notifications.recv() => match received {
                    Some(notification) => self.submit(notification).await,
                    None => {
                        info!("Notification channel closed, watch engine stopping");
                        break;
                    }
                },

                _ = sleep_until(wakeup) => {
                    if let Some(report) = self.dispatch_ready().await? {
                        debug!(units = report.units, changes = report.changes, "Dispatch pass finished");
                    }
                }
            }
        }

        if let Some(report) = self.flush().await? {
            info!(units = report.units, "Flushed pending changes before shutdown");
        }
        info!("Watch engine stopped");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch pass
    // ------------------------------------------------------------------------

    async fn dispatch(
        &self,
        mut state: MutexGuard<'_, WatchState>,
        batch: Vec<PendingChange>,
    ) -> Result<DispatchReport, EngineError> {
        let mut input = batch;
        input.extend(
            std::mem::take(&mut state.failed)
                .into_values()
                .map(|change| change.with_origin(ChangeOrigin::Retry)),
        );
        input.extend(
            state
                .in_flight
                .values()
                .cloned()
                .map(|change| change.with_origin(ChangeOrigin::InFlight)),
        );
        let persisted: HashSet<ChangeId> = input
            .iter()
            .filter(|change| change.persisted && !change.is_in_flight())
            .map(|change| change.id)
            .collect();

        let mut resolution = self.resolver.resolve(input);
        let mut report = DispatchReport {
            units: resolution.units.len(),
            changes: resolution
                .units
                .iter()
                .map(|unit| own_changes(unit).count())
                .sum(),
            dropped: resolution.dropped.len(),
            absorbed: resolution.absorbed.len(),
            errors: Vec::new(),
        };

        let recorded: BTreeSet<ChangeId> = resolution
            .units
            .iter()
            .map(|unit| unit.change.id)
            .chain(state.dispatched.keys().copied())
            .collect();
        let committed = match self.persist(&resolution, &persisted, &recorded, &mut report).await {
            Ok(committed) => committed,
            Err(e) => {
                self.halt(&e).await;
                return Err(e);
            }
        };

        for unit in &mut resolution.units {
            mark_persisted(unit, committed);
            let members: Vec<ChangeId> = own_changes(unit).map(|change| change.id).collect();
            for change in own_changes(unit) {
                state.in_flight.insert(change.id, change.clone());
            }
            state.dispatched.insert(unit.change.id, members);
        }
        drop(state);

        if !report.errors.is_empty() {
            self.publish(EngineEvent::new(
                Severity::Warning,
                "Event log update failed",
                report.errors.join("; "),
            ))
            .await;
        }
        if resolution.units.is_empty() {
            return Ok(report);
        }

        let roots: Vec<ChangeId> = resolution.units.iter().map(|unit| unit.change.id).collect();
        info!(units = report.units, changes = report.changes, "Dispatching changes");
        if let Err(e) = self.sink.dispatch(resolution.units).await {
            report.record_error("dispatch", &e);
            self.requeue(&roots).await;
            self.publish(EngineEvent::new(
                Severity::Warning,
                "Dispatch failed",
                format!("{e:#}"),
            ))
            .await;
        }
        Ok(report)
    }

    /// Write one pass into the event log
    ///
    /// Returns whether the transaction committed. Only a failed reorder is
    /// an error; everything else is recorded in the report.
    async fn persist(
        &self,
        resolution: &Resolution,
        persisted: &HashSet<ChangeId>,
        recorded: &BTreeSet<ChangeId>,
        report: &mut DispatchReport,
    ) -> Result<bool, EngineError> {
        if let Err(e) = self.event_log.begin_transaction().await {
            report.record_error("begin transaction", &e);
            return Ok(false);
        }

        // Discarded changes and changes folded under another root lose
        // their own record.
        let mut stale: Vec<ChangeId> = resolution
            .discarded()
            .filter(|id| persisted.contains(id))
            .collect();
        for unit in &resolution.units {
            stale.extend(
                own_changes(unit)
                    .map(|change| change.id)
                    .filter(|id| *id != unit.change.id && persisted.contains(id)),
            );
        }
        for id in stale {
            match self.event_log.retract(id).await {
                Ok(()) => debug!(id = %id, "Record retracted"),
                Err(e) if e.is_benign() => debug!(id = %id, error = %e, "Record already retracted"),
                Err(e) => report.record_error("retract", &e),
            }
        }

        let records: Vec<LoggedChange> = resolution.units.iter().map(LoggedChange::from).collect();
        if !records.is_empty() {
            if let Err(e) = self.event_log.merge_changes(&records).await {
                report.record_error("merge changes", &e);
            }
        }

        for &(first, second) in &resolution.reorders {
            if !(recorded.contains(&first) && recorded.contains(&second)) {
                continue;
            }
            if let Err(source) = self.event_log.swap_order(first, second).await {
                if let Err(e) = self.event_log.rollback().await {
                    warn!(error = %e, "Rollback after failed reorder failed");
                }
                return Err(EngineError::OrderingCorrupted {
                    first,
                    second,
                    source,
                });
            }
            debug!(first = %first, second = %second, "Records reordered");
        }

        match self.event_log.commit().await {
            Ok(()) => Ok(true),
            Err(e) => {
                report.record_error("commit", &e);
                Ok(false)
            }
        }
    }

    /// Move the units rooted at `roots` back to the retry list
    async fn requeue(&self, roots: &[ChangeId]) {
        let mut state = self.state.lock().await;
        for root in roots {
            for change in state.settle(*root) {
                state.failed.insert(change.id, change);
            }
        }
    }

    async fn halt(&self, error: &EngineError) {
        self.halted.store(true, Ordering::Release);
        error!(error = %error, "Watch engine halted");
        self.publish(EngineEvent::new(
            Severity::Critical,
            "Change engine stopped",
            error.to_string(),
        ))
        .await;
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_halted() {
            Err(EngineError::Halted)
        } else {
            Ok(())
        }
    }

    async fn log_failure(&self, operation: &str, id: Option<ChangeId>, error: &LogError) {
        warn!(operation, error = %error, "Event log update failed");
        let mut event = EngineEvent::new(
            Severity::Warning,
            "Event log update failed",
            format!("{operation}: {error}"),
        );
        if let Some(id) = id {
            event = event.for_change(id);
        }
        self.publish(event).await;
    }

    /// Reporting never fails the pipeline
    async fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.reporter.report(&event).await {
            warn!(title = %event.title, error = %e, "Failed to publish engine event");
        }
    }
}

/// Changes of a unit that this pass dispatched, in execution order
fn own_changes(unit: &DispatchUnit) -> impl Iterator<Item = &PendingChange> {
    unit.execution_order()
        .into_iter()
        .filter(|change| !change.is_in_flight())
}

fn mark_persisted(unit: &mut DispatchUnit, committed: bool) {
    if !unit.change.is_in_flight() {
        unit.change.persisted |= committed;
    }
    for dependency in &mut unit.dependencies {
        mark_persisted(dependency, committed);
    }
}

/// The queue works on `std` instants; going through tokio's clock keeps
/// paused test time consistent.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Unit tests
// ============================================================================
