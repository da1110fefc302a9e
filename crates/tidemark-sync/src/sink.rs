//! Channel-backed change sink
//!
//! [`ChannelSink`] forwards each dispatched batch of [`DispatchUnit`]s over a
//! bounded `mpsc` channel to whatever task performs the uploads. The
//! receiving task reports back through `WatchEngine::report_completed` and
//! `WatchEngine::report_failed`.

use anyhow::Context;
use async_trait::async_trait;
use tidemark_core::domain::DispatchUnit;
use tidemark_core::ports::IChangeSink;
use tokio::sync::mpsc;
use tracing::debug;

/// Sends dispatched units to a worker task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<DispatchUnit>>,
}

impl ChannelSink {
    /// Creates the sink and the receiver the worker drains
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<DispatchUnit>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl IChangeSink for ChannelSink {
    async fn dispatch(&self, units: Vec<DispatchUnit>) -> anyhow::Result<()> {
        let count = units.len();
        self.tx
            .send(units)
            .await
            .map_err(|_| anyhow::anyhow!("receiver dropped"))
            .context("Failed to hand units to the sync worker")?;
        debug!(units = count, "Units handed to the sync worker");
        Ok(())
    }
}
