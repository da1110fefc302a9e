//! Domain types for the change engine
//!
//! Pure data: paths, identifiers, entry metadata and change records.

pub mod change;
pub mod entry;
pub mod errors;
pub mod newtypes;

pub use change::{
    ChangeKind, ChangeOrigin, DelayState, DispatchUnit, Notification, PendingChange, RemoteChange,
};
pub use entry::{EntryMetadata, HashableMetadata, PathEntry, RemoteIdentity};
pub use errors::DomainError;
pub use newtypes::{ChangeId, LocalPath, PathCase, RemoteId, TransferId};
