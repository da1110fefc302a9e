//! Tidemark Core - Domain model and port definitions
//!
//! This crate contains the hexagonal architecture core of the change engine:
//! - **Domain types** - `LocalPath`, `EntryMetadata`, `PendingChange`, `DispatchUnit`, `RemoteChange`
//! - **Port definitions** - Traits for adapters: `IEventLog`, `IChangeSink`, `IMetadataProbe`,
//!   `ITransferRegistry`, `IEventReporter`
//! - **Configuration** - YAML configuration with validation and a builder
//!
//! # Architecture
//!
//! The domain module is pure data with no I/O. Ports define the trait
//! interfaces that the sync crate and external engines implement.

pub mod config;
pub mod domain;
pub mod ports;
