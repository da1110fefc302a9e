//! Event reporter that writes to the log
//!
//! [`TracingReporter`] is the default [`IEventReporter`]: it turns engine
//! events into `tracing` records at a level matching their severity. Nothing
//! in it can fail, so event delivery never interrupts the pipeline.

use async_trait::async_trait;
use tidemark_core::ports::{EngineEvent, IEventReporter, Severity};
use tracing::{error, info, warn};

/// Reports engine events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl TracingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IEventReporter for TracingReporter {
    async fn report(&self, event: &EngineEvent) -> anyhow::Result<()> {
        let change = event.change.map(|id| id.to_string()).unwrap_or_default();
        match event.severity {
            Severity::Info => info!(change = %change, body = %event.body, "{}", event.title),
            Severity::Warning => warn!(change = %change, body = %event.body, "{}", event.title),
            Severity::Error | Severity::Critical => error!(
                severity = %event.severity,
                change = %change,
                body = %event.body,
                "{}",
                event.title
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tidemark_core::domain::ChangeId;

    use super::*;

    #[tokio::test]
    async fn test_every_severity_is_accepted() {
        let reporter = TracingReporter::new();
        for severity in [
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            let event = EngineEvent::new(severity, "title", "body").for_change(ChangeId::new(1));
            assert!(reporter.report(&event).await.is_ok());
        }
    }
}
