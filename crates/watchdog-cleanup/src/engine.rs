//! Batched age-based deletion

use crate::{BatchEntryResult, BatchOptions, TableRow, TableStore, DIAGNOSTIC_TABLES, MAXIMUM_BATCH_SIZE};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use watchdog_common::{is_success_code, Error, HealthState, Result, SettingsHandle};

const BATCH_PAUSE: Duration = Duration::from_millis(100);
const BATCH_SERVER_TIMEOUT: Duration = Duration::from_secs(5);
const BATCH_OVERALL_TIMEOUT: Duration = Duration::from_secs(60);
const BATCH_RETRY_BASE: Duration = Duration::from_secs(1);
const BATCH_RETRY_ATTEMPTS: u32 = 3;

/// Deletes diagnostic rows older than the configured retention window
pub struct CleanupEngine {
    table_store: Arc<dyn TableStore>,
    settings: Arc<SettingsHandle>,
    health: RwLock<HealthState>,
    deleted_total: AtomicU64,
}

impl CleanupEngine {
    pub fn new(table_store: Arc<dyn TableStore>, settings: Arc<SettingsHandle>) -> Self {
        Self {
            table_store,
            settings,
            health: RwLock::new(HealthState::Ok),
            deleted_total: AtomicU64::new(0),
        }
    }

    pub fn health_state(&self) -> HealthState {
        *self.health.read()
    }

    /// Rows deleted over the lifetime of this engine
    pub fn deleted_total(&self) -> u64 {
        self.deleted_total.load(Ordering::Relaxed)
    }

    /// One tick with health bookkeeping; never lets an error escape
    pub async fn run_tick(&self, cancel: &CancellationToken) {
        match self.tick(cancel).await {
            Ok(()) => *self.health.write() = HealthState::Ok,
            Err(e) => {
                error!("cleanup tick failed: {}", e);
                *self.health.write() = HealthState::Error;
            }
        }
    }

    /// Age out old rows from every diagnostic table
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        let settings = self.settings.get();
        if settings.diagnostic_endpoint.is_empty() || settings.diagnostic_sas_token.is_empty() {
            debug!("diagnostic store not configured, skipping cleanup");
            return Ok(());
        }

        let keep = chrono::Duration::from_std(settings.diagnostic_time_to_keep())
            .map_err(|e| Error::Configuration(format!("time-to-keep out of range: {}", e)))?;
        let cutoff = Utc::now() - keep;

        for table in DIAGNOSTIC_TABLES {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.clean_table(table, cutoff, settings.diagnostic_target_count, cancel)
                .await?;
        }
        Ok(())
    }

    async fn clean_table(
        &self,
        table: &str,
        cutoff: DateTime<Utc>,
        target_count: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.table_store.table_exists(table).await? {
            return Ok(());
        }

        let mut deleted: u64 = 0;
        let mut continuation = None;
        loop {
            let (rows, next) = self
                .table_store
                .query_older_than(table, cutoff, continuation)
                .await?;

            for batch in partition_batches(rows) {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                deleted += self.submit_batch(table, batch).await? as u64;
                if deleted >= target_count {
                    info!(
                        "cleanup of {} reached target count ({} rows deleted)",
                        table, deleted
                    );
                    self.deleted_total.fetch_add(deleted, Ordering::Relaxed);
                    return Ok(());
                }
                // Pause between batches to stay under storage throttling.
                tokio::time::sleep(BATCH_PAUSE).await;
            }

            match next {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        if deleted > 0 {
            info!("cleanup of {} deleted {} rows", table, deleted);
        }
        self.deleted_total.fetch_add(deleted, Ordering::Relaxed);
        Ok(())
    }

    /// Submit one batch, retrying with exponential backoff and evicting rows
    /// the server no longer knows. Returns the number of rows deleted; an
    /// abandoned batch deletes none.
    async fn submit_batch(&self, table: &str, rows: Vec<TableRow>) -> Result<usize> {
        tokio::time::timeout(BATCH_OVERALL_TIMEOUT, self.submit_batch_inner(table, rows))
            .await
            .map_err(|_| Error::Timeout(format!("batch deletion against {} overran", table)))?
    }

    async fn submit_batch_inner(&self, table: &str, mut rows: Vec<TableRow>) -> Result<usize> {
        let options = BatchOptions {
            server_timeout: BATCH_SERVER_TIMEOUT,
        };
        let mut attempts: u32 = 0;
        loop {
            let results = match self.table_store.delete_batch(table, &rows, &options).await {
                Ok(results) => results,
                Err(e) if e.is_transient() => {
                    attempts += 1;
                    if attempts >= BATCH_RETRY_ATTEMPTS {
                        return Err(e);
                    }
                    tokio::time::sleep(BATCH_RETRY_BASE * 2u32.pow(attempts - 1)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match first_failure(&results) {
                None => return Ok(rows.len()),
                Some(failure) => {
                    if let Some(index_text) = &failure.resource_not_found {
                        match index_text.parse::<usize>() {
                            Ok(index) if index < rows.len() => {
                                debug!(
                                    "row {} of a {}-row batch against {} is gone, resubmitting",
                                    index,
                                    rows.len(),
                                    table
                                );
                                rows.remove(index);
                                if rows.is_empty() {
                                    return Ok(0);
                                }
                                continue;
                            }
                            _ => {
                                warn!(
                                    "abandoning batch against {}: unusable row index '{}'",
                                    table, index_text
                                );
                                return Ok(0);
                            }
                        }
                    }
                    attempts += 1;
                    if attempts >= BATCH_RETRY_ATTEMPTS {
                        return Err(Error::Storage(format!(
                            "batch deletion against {} failed with status {}",
                            table, failure.status
                        )));
                    }
                    tokio::time::sleep(BATCH_RETRY_BASE * 2u32.pow(attempts - 1)).await;
                }
            }
        }
    }
}

fn first_failure(results: &[BatchEntryResult]) -> Option<&BatchEntryResult> {
    results.iter().find(|r| !is_success_code(r.status))
}

/// Group rows by partition key, preserving encounter order, then split each
/// group into batches within the size cap.
fn partition_batches(rows: Vec<TableRow>) -> Vec<Vec<TableRow>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<TableRow>> = HashMap::new();
    for row in rows {
        if !groups.contains_key(&row.partition_key) {
            order.push(row.partition_key.clone());
        }
        groups.entry(row.partition_key.clone()).or_default().push(row);
    }

    let mut batches = Vec::new();
    for key in order {
        let group = groups.remove(&key).unwrap_or_default();
        for chunk in group.chunks(MAXIMUM_BATCH_SIZE) {
            batches.push(chunk.to_vec());
        }
    }
    batches
}
