//! Diagnostic-table cleanup engine

mod engine;
mod memory;

pub use engine::CleanupEngine;
pub use memory::MemoryTableStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use watchdog_common::Result;

/// Diagnostic tables aged out by the cleanup engine
pub const DIAGNOSTIC_TABLES: [&str; 3] = [
    "WADPerformanceCountersTable",
    "WADDiagnosticInfrastructureLogsTable",
    "WADWindowsEventLogsTable",
];

/// Upper bound on rows per deletion batch
pub const MAXIMUM_BATCH_SIZE: usize = 100;

/// A row eligible for deletion
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub partition_key: String,
    pub row_key: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-call options for a batch submission
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub server_timeout: Duration,
}

/// Outcome of one entry in a deletion batch.
///
/// A failing batch carries at least one non-success status; when the failure
/// is the storage side's resource-not-found, `resource_not_found` holds the
/// row index the server reported, as a string the caller must parse.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntryResult {
    pub status: u16,
    pub resource_not_found: Option<String>,
}

/// External tabular store holding the diagnostic tables
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Rows with `Timestamp < cutoff`, one page per call
    async fn query_older_than(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        continuation: Option<String>,
    ) -> Result<(Vec<TableRow>, Option<String>)>;

    async fn delete_batch(
        &self,
        table: &str,
        rows: &[TableRow],
        options: &BatchOptions,
    ) -> Result<Vec<BatchEntryResult>>;
}
