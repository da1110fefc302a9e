//! Event reporter port (driven/secondary port)
//!
//! Failures that a user or operator should see are published through this
//! trait as short messages with a severity. Implementations may forward them
//! to desktop notifications, a status socket or just the log.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because delivery is adapter-specific.
//! - Reporting is fire-and-forget; the engine logs and ignores delivery
//!   failures.

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::ChangeId;

/// How serious an engine event is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
    /// The pipeline stopped
    Critical,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A message published by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub severity: Severity,
    pub title: String,
    pub body: String,
    /// The change the event is about, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeId>,
}

impl EngineEvent {
    pub fn new(severity: Severity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
            change: None,
        }
    }

    #[must_use]
    pub fn for_change(mut self, id: ChangeId) -> Self {
        self.change = Some(id);
        self
    }
}

/// Publishes engine events
#[async_trait]
pub trait IEventReporter: Send + Sync {
    async fn report(&self, event: &EngineEvent) -> anyhow::Result<()>;
}
