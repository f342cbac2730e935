//! Backend-neutral contract for persisting one file's sales lines.

use async_trait::async_trait;
use salesload_core::{FileBatch, PersistenceError, SalesLine, WriteOutcome};
use serde::Serialize;
use tracing::info;

/// Row counts per entity, as reported by `salesload status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub shops: i64,
    pub cash_registers: i64,
    pub sales_lines: i64,
}

/// A relational sales store.
///
/// `write_file` is all-or-nothing per batch: the shop and register are upserted,
/// every line whose idempotency key is new is inserted, lines whose key already
/// exists are counted as duplicates, and any other failure leaves storage untouched.
#[async_trait]
pub trait SalesStore: Send + Sync {
    /// Create tables and constraints if absent. Safe to call on every start.
    async fn ensure_schema(&self) -> Result<(), PersistenceError>;

    async fn write_file(&self, batch: &FileBatch) -> Result<WriteOutcome, PersistenceError>;

    async fn counts(&self) -> Result<StoreCounts, PersistenceError>;
}

pub(crate) fn log_duplicate(batch: &FileBatch, line: &SalesLine) {
    info!(
        source_file = %batch.source_file,
        doc_id = %line.doc_id,
        row_num = line.row_num,
        "duplicate sales line skipped"
    );
}
