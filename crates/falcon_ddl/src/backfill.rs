//! Backfill of an added column's default into pre-existing rows.
//!
//! Rows are discovered by scanning the table at the job's anchored snapshot.
//! Each row is handled in its own retryable transaction against the live
//! store: a row deleted since the snapshot is skipped, a row whose cell is
//! already present (written by a concurrent insert or an earlier run) is left
//! alone, and otherwise the row key is locked and the default is written.

use std::sync::Arc;

use falcon_common::error::FalconResult;
use falcon_common::schema::ColumnInfo;
use falcon_common::types::{JobId, Timestamp};
use falcon_storage::codec::decode_handle_from_row_key;
use falcon_storage::{run_in_new_txn, Storage, Table};

use crate::reorg::ReorgSignal;
use crate::scanner::RowScanner;
use crate::tracker::DdlJobTracker;

/// Rows between two progress reports.
const PROGRESS_INTERVAL: u64 = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillStats {
    pub scanned: u64,
    pub backfilled: u64,
    pub skipped_deleted: u64,
    pub skipped_present: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Backfilled,
    Deleted,
    Present,
}

pub struct BackfillTask {
    store: Arc<dyn Storage>,
    table: Table,
    column: ColumnInfo,
    snapshot_ver: Timestamp,
    job_id: JobId,
    tracker: Option<Arc<DdlJobTracker>>,
}

impl BackfillTask {
    pub fn new(
        store: Arc<dyn Storage>,
        table: Table,
        column: ColumnInfo,
        snapshot_ver: Timestamp,
        job_id: JobId,
    ) -> Self {
        Self {
            store,
            table,
            column,
            snapshot_ver,
            job_id,
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<DdlJobTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Walk every row visible at the snapshot. Returns once the scan is
    /// exhausted; stops early with `ReorgCancelled` when `signal` fires.
    pub fn run(&self, signal: &ReorgSignal) -> FalconResult<BackfillStats> {
        let mut scanner = RowScanner::open(self.store.as_ref(), &self.table, self.snapshot_ver)?;
        let mut stats = BackfillStats::default();
        tracing::info!(
            "DDL {} backfill of column '{}' started at {}",
            self.job_id,
            self.column.name,
            self.snapshot_ver
        );

        while let Some(key) = scanner.next() {
            signal.check()?;
            let handle = decode_handle_from_row_key(&key?)?;
            stats.scanned += 1;
            match self.backfill_row(handle)? {
                RowOutcome::Backfilled => stats.backfilled += 1,
                RowOutcome::Deleted => stats.skipped_deleted += 1,
                RowOutcome::Present => stats.skipped_present += 1,
            }
            scanner.seek_past_row(&self.table.record_key(handle, None));

            if stats.scanned % PROGRESS_INTERVAL == 0 {
                tracing::debug!(
                    "DDL {} backfill progress: scanned={}, backfilled={}",
                    self.job_id,
                    stats.scanned,
                    stats.backfilled
                );
                self.report(&stats);
            }
        }

        self.report(&stats);
        tracing::info!(
            "DDL {} backfill done: scanned={}, backfilled={}, deleted={}, present={}",
            self.job_id,
            stats.scanned,
            stats.backfilled,
            stats.skipped_deleted,
            stats.skipped_present
        );
        Ok(stats)
    }

    fn report(&self, stats: &BackfillStats) {
        if let Some(tracker) = &self.tracker {
            tracker.record_progress(self.job_id, stats.scanned, stats.backfilled);
        }
    }

    fn backfill_row(&self, handle: i64) -> FalconResult<RowOutcome> {
        let lock_key = self.table.record_key(handle, None);
        let cell_key = self.table.record_key(handle, Some(&self.column));
        run_in_new_txn(self.store.as_ref(), true, |txn| {
            if !self.table.row_exists(txn, handle)? {
                return Ok(RowOutcome::Deleted);
            }
            match txn.get(&cell_key) {
                Ok(_) => return Ok(RowOutcome::Present),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            txn.lock_keys(&[lock_key.as_slice()])?;
            self.table
                .set_col_value(txn, &cell_key, &self.column.default_value)?;
            Ok(RowOutcome::Backfilled)
        })
    }
}
