//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the change engine depends on. The sync crate
//! ships in-memory and filesystem implementations; an external sync engine
//! provides its own.
//!
//! ## Ports Overview
//!
//! - [`IEventLog`] - Durable, re-orderable record of dispatched changes
//! - [`IChangeSink`] - Receives resolved dependency trees for upload
//! - [`IMetadataProbe`] - Reads the current on-disk metadata of a path
//! - [`ITransferRegistry`] - Lists in-flight transfers under a subtree
//! - [`IEventReporter`] - Publishes engine events with a severity

pub mod change_sink;
pub mod event_log;
pub mod metadata_probe;
pub mod reporter;
pub mod transfers;

pub use change_sink::IChangeSink;
pub use event_log::{IEventLog, LogError, LoggedChange};
pub use metadata_probe::IMetadataProbe;
pub use reporter::{EngineEvent, IEventReporter, Severity};
pub use transfers::{ITransferHandle, ITransferRegistry, PauseGuard, TransferDirection, TransferTarget};
