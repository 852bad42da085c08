//! In-memory table store for tests and local runs

use crate::{BatchEntryResult, BatchOptions, TableRow, TableStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use watchdog_common::{Error, Result};

/// Table store backed by per-table row vectors
#[derive(Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<String, Vec<TableRow>>>,
    fail_deletes: Mutex<u32>,
    not_found_once: Mutex<Option<String>>,
    delete_calls: AtomicUsize,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<TableRow>) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.lock().get(table).map_or(0, Vec::len)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// The next `count` delete calls fail with a transient fault
    pub fn fail_next_deletes(&self, count: u32) {
        *self.fail_deletes.lock() = count;
    }

    /// The next delete call reports resource-not-found at `index` (verbatim,
    /// parseable or not) without deleting anything
    pub fn inject_not_found(&self, index: &str) {
        *self.not_found_once.lock() = Some(index.to_string());
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.tables.lock().contains_key(table))
    }

    async fn query_older_than(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        _continuation: Option<String>,
    ) -> Result<(Vec<TableRow>, Option<String>)> {
        let tables = self.tables.lock();
        let rows = tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.timestamp < cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok((rows, None))
    }

    async fn delete_batch(
        &self,
        table: &str,
        rows: &[TableRow],
        _options: &BatchOptions,
    ) -> Result<Vec<BatchEntryResult>> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);

        {
            let mut failures = self.fail_deletes.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::Transient("simulated storage throttling".into()));
            }
        }

        if let Some(index) = self.not_found_once.lock().take() {
            return Ok(vec![BatchEntryResult {
                status: 404,
                resource_not_found: Some(index),
            }]);
        }

        let mut tables = self.tables.lock();
        if let Some(stored) = tables.get_mut(table) {
            stored.retain(|r| {
                !rows
                    .iter()
                    .any(|d| d.partition_key == r.partition_key && d.row_key == r.row_key)
            });
        }
        Ok(rows
            .iter()
            .map(|_| BatchEntryResult {
                status: 204,
                resource_not_found: None,
            })
            .collect())
    }
}
