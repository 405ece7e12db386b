// 📥 Load Stage
// Staging-then-swap inside one store transaction, one load per table at a time.

use crate::config::LoadMode;
use crate::db::{staging_name, AnalyticalStore};
use crate::deadline::Deadline;
use crate::error::{PipelineError, Result, StoreError};
use crate::orchestrator::CancelToken;
use crate::records::FeatureRecord;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Rows written per insert batch; cancellation is checked between batches.
const BATCH_ROWS: usize = 5_000;

// ============================================================================
// PER-TABLE LOAD LOCK
// ============================================================================

static LOAD_LOCKS: Lazy<(Mutex<HashSet<String>>, Condvar)> =
    Lazy::new(|| (Mutex::new(HashSet::new()), Condvar::new()));

/// Held for the duration of one load; released on drop.
#[derive(Debug)]
pub struct TableLock {
    table: String,
}

impl TableLock {
    /// Wait up to `timeout` for any other load of `table` to finish.
    pub fn acquire(table: &str, timeout: Duration) -> Result<TableLock> {
        let (held, released) = &*LOAD_LOCKS;
        let deadline = Deadline::after(timeout);
        let mut tables = held.lock().unwrap_or_else(|e| e.into_inner());

        while tables.contains(table) {
            if deadline.expired() {
                return Err(PipelineError::Timeout {
                    operation: format!("load lock on {}", table),
                    budget: timeout,
                });
            }
            let (guard, _) = released
                .wait_timeout(tables, deadline.remaining())
                .unwrap_or_else(|e| e.into_inner());
            tables = guard;
        }

        tables.insert(table.to_string());
        Ok(TableLock {
            table: table.to_string(),
        })
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let (held, released) = &*LOAD_LOCKS;
        let mut tables = held.lock().unwrap_or_else(|e| e.into_inner());
        tables.remove(&self.table);
        released.notify_all();
    }
}

// ============================================================================
// LOAD
// ============================================================================

#[derive(Debug, Clone)]
pub struct LoadRequest<'a> {
    pub table: &'a str,
    pub mode: LoadMode,
    pub run_id: &'a str,
    /// Budget for waiting on the lock and for the store work itself
    pub timeout: Duration,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_written: usize,
    /// Rows in the table's high-risk alerts view after the swap
    pub alerts_in_table: usize,
}

fn load_error(table: &str, e: StoreError) -> PipelineError {
    match e {
        StoreError::Timeout(budget) => PipelineError::Timeout {
            operation: format!("load {}", table),
            budget,
        },
        other => PipelineError::LoadFailed {
            table: table.to_string(),
            source: other,
        },
    }
}

fn write_and_swap<S: AnalyticalStore + ?Sized>(
    store: &mut S,
    feature_records: &[FeatureRecord],
    request: &LoadRequest,
) -> Result<LoadOutcome> {
    let table = request.table;
    let staging = staging_name(table);
    let store_err = |e: StoreError| load_error(table, e);

    store.begin().map_err(store_err)?;
    store.create_or_replace_table(&staging).map_err(store_err)?;

    for batch in feature_records.chunks(BATCH_ROWS) {
        if request.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        store
            .append_rows(&staging, request.run_id, batch)
            .map_err(store_err)?;
    }

    let rows_written = store
        .swap_in(&staging, table, request.mode, request.run_id)
        .map_err(store_err)?;
    let alerts_in_table = store.count_alerts(table).map_err(store_err)?;

    // Last point where the run can still back out cleanly
    if request.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    store.commit().map_err(store_err)?;

    Ok(LoadOutcome {
        rows_written,
        alerts_in_table,
    })
}

/// Write `feature_records` into `request.table`. Readers see the table either
/// before or after the load; on any failure the store is rolled back.
pub fn load<S: AnalyticalStore + ?Sized>(
    store: &mut S,
    feature_records: &[FeatureRecord],
    request: &LoadRequest,
) -> Result<LoadOutcome> {
    let _lock = TableLock::acquire(request.table, request.timeout)?;

    store.set_deadline(Some(Deadline::after(request.timeout)));
    let result = write_and_swap(store, feature_records, request);
    store.set_deadline(None);

    match result {
        Ok(outcome) => {
            info!(
                table = request.table,
                mode = request.mode.name(),
                rows = outcome.rows_written,
                alerts = outcome.alerts_in_table,
                "load committed"
            );
            Ok(outcome)
        }
        Err(e) => {
            if let Err(rollback) = store.rollback() {
                warn!(table = request.table, error = %rollback, "rollback failed");
            }
            warn!(table = request.table, error = %e, "load rolled back");
            Err(e)
        }
    }
}
