//! Shared helpers for pipeline integration tests
//!
//! Builds a [`WatchEngine`] over a real temporary directory with the
//! filesystem probe, the in-memory event log and a channel sink the test
//! drains itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tidemark_core::config::DebounceSettings;
use tidemark_core::domain::{ChangeKind, DispatchUnit, LocalPath, Notification, PathCase};
use tidemark_core::ports::{
    IChangeSink, IEventLog, IEventReporter, IMetadataProbe, ITransferRegistry,
};
use tidemark_sync::engine::{EnginePorts, WatchEngine};
use tidemark_sync::event_log::MemoryEventLog;
use tidemark_sync::filesystem::{scan_tree, LocalMetadataProbe};
use tidemark_sync::reporter::TracingReporter;
use tidemark_sync::sink::ChannelSink;
use tidemark_sync::transfers::TransferTable;
use tokio::sync::mpsc;

pub fn path(s: &str) -> LocalPath {
    LocalPath::new(s).unwrap()
}

pub struct Pipeline {
    pub dir: TempDir,
    pub log: Arc<MemoryEventLog>,
    pub transfers: Arc<TransferTable>,
    pub engine: Arc<WatchEngine>,
    units: mpsc::Receiver<Vec<DispatchUnit>>,
}

impl Pipeline {
    /// Start over a tree holding `folders` and `files`
    pub async fn with_tree(folders: &[&str], files: &[(&str, &[u8])]) -> Self {
        let dir = TempDir::new().unwrap();
        for folder in folders {
            std::fs::create_dir_all(dir.path().join(folder)).unwrap();
        }
        for (file, contents) in files {
            std::fs::write(dir.path().join(file), contents).unwrap();
        }

        let log = Arc::new(MemoryEventLog::new());
        let transfers = Arc::new(TransferTable::new());
        let (sink, units) = ChannelSink::new(16);
        let ports = EnginePorts {
            probe: Arc::new(LocalMetadataProbe::new(dir.path())) as Arc<dyn IMetadataProbe>,
            event_log: Arc::clone(&log) as Arc<dyn IEventLog>,
            sink: Arc::new(sink) as Arc<dyn IChangeSink>,
            transfers: Arc::clone(&transfers) as Arc<dyn ITransferRegistry>,
            reporter: Arc::new(TracingReporter::new()) as Arc<dyn IEventReporter>,
        };
        let settings = DebounceSettings {
            delay: Duration::from_millis(50),
            max_resets: 500,
            batch_window: Duration::from_millis(20),
            batch_limit: 500,
        };
        let engine = Arc::new(WatchEngine::new(
            dir.path(),
            settings,
            PathCase::Sensitive,
            ports,
        ));

        let snapshot = scan_tree(dir.path()).await.unwrap();
        engine.bootstrap(snapshot, Vec::new()).await;

        Self {
            dir,
            log,
            transfers,
            engine,
            units,
        }
    }

    pub fn abs(&self, p: &str) -> PathBuf {
        path(p).to_absolute(self.dir.path())
    }

    pub async fn notify(&self, kind: ChangeKind, p: &str) {
        self.engine.submit(Notification::new(kind, path(p))).await;
    }

    /// Fire everything and collect what reached the sink
    pub async fn flush(&mut self) -> Vec<DispatchUnit> {
        self.engine.flush().await.unwrap();
        let mut units = Vec::new();
        while let Ok(batch) = self.units.try_recv() {
            units.extend(batch);
        }
        units
    }
}
