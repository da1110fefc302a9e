//! Integration tests for tidemark-sync
//!
//! Runs the whole pipeline over a temporary directory: real metadata probe,
//! debounce queue, resolver, in-memory event log and a channel sink.

mod common;

mod test_local_changes;
mod test_remote_changes;
