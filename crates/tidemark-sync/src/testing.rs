//! Shared fixtures for unit tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tidemark_core::domain::{DispatchUnit, EntryMetadata, LocalPath};
use tidemark_core::ports::{EngineEvent, IChangeSink, IEventReporter, IMetadataProbe};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn path(s: &str) -> LocalPath {
    LocalPath::new(s).unwrap()
}

/// A scripted disk the queue can probe
#[derive(Default)]
pub struct FakeDisk {
    entries: Mutex<BTreeMap<String, EntryMetadata>>,
}

impl FakeDisk {
    pub fn put(&self, p: &str, metadata: EntryMetadata) {
        self.entries.lock().unwrap().insert(path(p).as_str().to_string(), metadata);
    }

    pub fn file(&self, p: &str, size: u64, created: i64, modified: i64) -> EntryMetadata {
        let metadata = EntryMetadata::file(size, at(created), at(modified));
        self.put(p, metadata.clone());
        metadata
    }

    pub fn folder(&self, p: &str, created: i64) -> EntryMetadata {
        let metadata = EntryMetadata::folder(at(created), at(created));
        self.put(p, metadata.clone());
        metadata
    }

    pub fn remove(&self, p: &str) {
        let root = path(p);
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| !root.contains(&path(key), Default::default()));
    }

    pub fn rename(&self, from: &str, to: &str) {
        let (from, to) = (path(from), path(to));
        let mut entries = self.entries.lock().unwrap();
        let moved: Vec<(String, EntryMetadata)> = entries
            .iter()
            .filter(|(key, _)| from.contains(&path(key), Default::default()))
            .map(|(key, metadata)| (key.clone(), metadata.clone()))
            .collect();
        for (key, metadata) in moved {
            entries.remove(&key);
            let target = path(&key).rebase(&from, &to, Default::default()).unwrap();
            entries.insert(target.as_str().to_string(), metadata);
        }
    }
}

impl IMetadataProbe for FakeDisk {
    fn probe(&self, path: &LocalPath) -> anyhow::Result<Option<EntryMetadata>> {
        Ok(self.entries.lock().unwrap().get(path.as_str()).cloned())
    }
}

/// Reporter that keeps every published event
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl IEventReporter for RecordingReporter {
    async fn report(&self, event: &EngineEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Sink that keeps every unit it accepted; can be switched to fail
#[derive(Default)]
pub struct RecordingSink {
    units: Mutex<Vec<DispatchUnit>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn units(&self) -> Vec<DispatchUnit> {
        self.units.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl IChangeSink for RecordingSink {
    async fn dispatch(&self, units: Vec<DispatchUnit>) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        self.units.lock().unwrap().extend(units);
        Ok(())
    }
}
