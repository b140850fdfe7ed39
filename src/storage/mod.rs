//! Event storage backends
//!
//! Both backends implement the same contract; capabilities that only one of
//! them has (relocation, size on disk) are part of the trait and report
//! `Unsupported`/`None` where they do not apply.

mod embedded_store;
mod remote_store;

pub use embedded_store::{EmbeddedStore, DEFAULT_STORE_FILE_NAME, SCHEMA_VERSION};
pub use remote_store::RemoteStore;

use crate::error::StorageError;
use crate::models::{ActivityEvent, BackendKind, DbStats};
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn supports_relocation(&self) -> bool;

    /// Durably write one event. Returns once the write is committed or has failed.
    async fn persist(&self, event: ActivityEvent) -> Result<(), StorageError>;

    /// Aggregates computed over committed events only.
    async fn query_stats(&self) -> Result<DbStats, StorageError>;

    /// Bytes used on disk, `None` when the backend cannot tell.
    fn size_on_disk(&self) -> Option<u64>;

    /// Move the store to `target`. The caller guarantees logging is paused.
    async fn relocate(&self, target: &Path) -> Result<(), StorageError>;

    /// Release files and connections. Called once at teardown.
    async fn close(&self);
}

/// Column list shared by both backends' insert statements
pub(crate) const ACTIVITY_COLUMNS: &str = "transaction_id, tool_source, method, scheme, host, \
     port, path, captured_at, capture_second, request_header_size, request_body_size, \
     request_body, response_status, response_size, response_body, in_scope";

pub(crate) fn clamp_count(value: i64) -> u64 {
    value.max(0) as u64
}
