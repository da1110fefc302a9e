//! Change sink port (driven/secondary port)
//!
//! The sync engine that uploads local changes receives them through this
//! trait, one resolved dependency tree per top-level change.

use async_trait::async_trait;

use crate::domain::DispatchUnit;

/// Receiver of resolved change trees
///
/// Each [`DispatchUnit`] may run independently of the others. Inside one
/// unit every dependency must complete before its parent starts. Changes with
/// origin `InFlight` are already running and only need to be awaited.
#[async_trait]
pub trait IChangeSink: Send + Sync {
    /// Hand a batch of units over; returning an error sends them to the retry list
    async fn dispatch(&self, units: Vec<DispatchUnit>) -> anyhow::Result<()>;
}
