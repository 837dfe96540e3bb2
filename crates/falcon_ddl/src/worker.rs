//! DDL job state machine.
//!
//! Each call to [`DdlWorker::handle_job`] advances an ADD COLUMN job by at
//! most one schema state inside a single metadata transaction:
//!
//!   None → DeleteOnly → WriteOnly → Reorganization → Public
//!
//! Every transition commits a new schema version. The Reorganization step
//! runs the backfill in the background and waits on it for a bounded time;
//! a timeout commits the anchored snapshot version and leaves the job where
//! it is, to be re-invoked later. If GC has moved past the anchored version
//! by then, the step re-anchors at the current version instead.
//!
//! A step works on a draft of the job and writes it back only when the step
//! commits or the job is cancelled, so a failed step leaves the caller's job
//! exactly as it was.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use falcon_common::config::DdlConfig;
use falcon_common::error::{
    DdlError, FalconError, FalconResult, MetaError, StorageError, TxnError,
};
use falcon_common::job::{ActionType, AlterSpecification, Job, JobState};
use falcon_common::schema::{SchemaState, TableInfo};
use falcon_common::types::Timestamp;
use falcon_storage::{run_in_new_txn, Meta, OwnerRecord, Storage, Table, Transaction};

use crate::backfill::BackfillTask;
use crate::mutator::{adjust_column_offsets, insert_column};
use crate::owner;
use crate::reorg::{ReorgOutcome, ReorgRunner};
use crate::tracker::DdlJobTracker;

/// What one invocation did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStep {
    /// The column moved to this state.
    Transitioned(SchemaState),
    /// Backfill still running; invoke again later.
    ReorgTimeout,
    /// The job is done or cancelled.
    Finished(JobState),
}

pub struct DdlWorker {
    store: Arc<dyn Storage>,
    config: DdlConfig,
    reorg: ReorgRunner,
    tracker: Arc<DdlJobTracker>,
    closed: AtomicBool,
}

impl DdlWorker {
    pub fn new(store: Arc<dyn Storage>, config: DdlConfig) -> Self {
        let tracker = Arc::new(DdlJobTracker::new(config.tracker_history));
        Self {
            store,
            config,
            reorg: ReorgRunner::new(),
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.config.owner_id
    }

    pub fn tracker(&self) -> &Arc<DdlJobTracker> {
        &self.tracker
    }

    /// Acquire or renew the DDL owner lease for this worker.
    pub fn campaign_owner(&self) -> FalconResult<OwnerRecord> {
        let record = run_in_new_txn(self.store.as_ref(), false, |txn| {
            let mut meta = Meta::new(txn);
            owner::campaign(
                &mut meta,
                &self.config.owner_id,
                self.config.lease_ms,
                owner::now_ms(),
            )
        })?;
        tracing::debug!(
            "DDL owner lease held by {} (expires_at_ms={})",
            record.owner_id,
            record.expires_at_ms
        );
        Ok(record)
    }

    /// Advance `job` by one step.
    ///
    /// Validation failures cancel the job (`Ok(Finished(Cancelled))`) and
    /// roll back the step's metadata changes. Any other error is returned
    /// with `job` unchanged.
    pub fn handle_job(&self, job: &mut Job) -> FalconResult<JobStep> {
        if job.is_finished() {
            return Ok(JobStep::Finished(job.state));
        }

        let mut draft = job.clone();
        let mut txn = self.store.begin()?;
        match self.run_step(txn.as_mut(), &mut draft) {
            Ok(step) => {
                txn.commit()?;
                *job = draft;
                self.tracker.observe(job);
                Ok(step)
            }
            Err(e) if e.is_user_error() => {
                txn.rollback();
                tracing::warn!("DDL {} cancelled: {}", job.id, e);
                job.state = JobState::Cancelled;
                job.error = Some(e.to_string());
                self.tracker.observe(job);
                Ok(JobStep::Finished(JobState::Cancelled))
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Drive `job` until it is done or cancelled, re-invoking after reorg
    /// timeouts and commit conflicts. The owner lease is renewed before every
    /// step. Returns early with the job's current state once the worker is
    /// closed.
    pub fn run_job(&self, job: &mut Job) -> FalconResult<JobState> {
        let txn_config = self.store.txn_config();
        let max_conflicts = txn_config.max_retries.max(1);
        let mut conflicts = 0u32;
        while !job.is_finished() {
            if self.is_closed() {
                tracing::warn!("DDL worker closed, leaving {} at {}", job.id, job.schema_state);
                break;
            }
            let step = self.campaign_owner().and_then(|_| self.handle_job(job));
            match step {
                Ok(JobStep::ReorgTimeout) => {
                    tracing::debug!("DDL {} re-enqueued after reorg timeout", job.id);
                }
                Ok(_) => conflicts = 0,
                Err(FalconError::Txn(TxnError::WriteConflict(txn)))
                    if conflicts + 1 < max_conflicts =>
                {
                    conflicts += 1;
                    tracing::warn!(
                        "DDL {} step conflicted ({}), retrying {}/{}",
                        job.id,
                        txn,
                        conflicts,
                        max_conflicts
                    );
                    std::thread::sleep(txn_config.backoff(conflicts));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(job.state)
    }

    /// Stop the worker: cancels a running backfill and makes `run_job`
    /// return at its next step.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reorg.close();
        tracing::info!("DDL worker {} closed", self.config.owner_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn run_step(&self, txn: &mut dyn Transaction, job: &mut Job) -> FalconResult<JobStep> {
        let mut meta = Meta::new(txn);
        owner::check_owner(&mut meta, &self.config.owner_id, owner::now_ms())?;
        match job.action {
            ActionType::AddColumn => self.on_add_column(&mut meta, job),
            ActionType::DropColumn => {
                Err(DdlError::UnsupportedAction(job.action.to_string()).into())
            }
        }
    }

    fn on_add_column(&self, meta: &mut Meta<'_>, job: &mut Job) -> FalconResult<JobStep> {
        let info = meta
            .get_table(job.schema_id, job.table_id)?
            .ok_or(MetaError::TableNotFound {
                schema_id: job.schema_id,
                table_id: job.table_id,
            })?;
        let spec: AlterSpecification = job.decode_args()?;

        let existing = info.find_column(&spec.column.name).cloned();
        let (mut info, column) = match existing {
            Some(col) if col.state == SchemaState::Public => {
                return Err(DdlError::ColumnExists(col.name).into());
            }
            Some(col) => (info, col),
            None => insert_column(&info, &spec)?,
        };

        meta.gen_schema_version()?;
        if job.state == JobState::Queueing {
            job.state = JobState::Running;
        }

        let next = match column.state {
            SchemaState::None => SchemaState::DeleteOnly,
            SchemaState::DeleteOnly => SchemaState::WriteOnly,
            SchemaState::WriteOnly => {
                job.snapshot_ver = 0;
                SchemaState::Reorganization
            }
            SchemaState::Reorganization => return self.reorganize(meta, job, info, &column.name),
            SchemaState::Public => {
                return Err(DdlError::InvalidColumnState(column.state.to_string()).into());
            }
        };

        set_column_state(&mut info, &column.name, next)?;
        meta.update_table(job.schema_id, &info)?;
        job.schema_state = next;
        tracing::info!(
            "DDL {} column '{}' of {}: {} -> {}",
            job.id,
            column.name,
            info.name,
            column.state,
            next
        );
        Ok(JobStep::Transitioned(next))
    }

    fn reorganize(
        &self,
        meta: &mut Meta<'_>,
        job: &mut Job,
        info: TableInfo,
        column_name: &str,
    ) -> FalconResult<JobStep> {
        if job.snapshot_ver == 0 {
            job.snapshot_ver = self.store.current_version()?.0;
            tracing::info!("DDL {} reorg snapshot anchored at {}", job.id, job.snapshot_ver);
        }
        let column = info
            .find_column(column_name)
            .cloned()
            .ok_or_else(|| DdlError::InvalidColumnState(format!("column {} vanished", column_name)))?;

        let task = BackfillTask::new(
            Arc::clone(&self.store),
            Table::new(info.clone()),
            column,
            Timestamp(job.snapshot_ver),
            job.id,
        )
        .with_tracker(Arc::clone(&self.tracker));
        let outcome = match self
            .reorg
            .run(job.id, self.config.reorg_wait_timeout(), move |signal| {
                task.run(&signal)
            }) {
            Err(FalconError::Storage(StorageError::SnapshotTooOld(stale))) => {
                job.snapshot_ver = self.store.current_version()?.0;
                tracing::warn!(
                    "DDL {} reorg snapshot {} is below the GC safepoint, re-anchored at {}",
                    job.id,
                    stale,
                    job.snapshot_ver
                );
                return Ok(JobStep::ReorgTimeout);
            }
            other => other?,
        };

        let stats = match outcome {
            ReorgOutcome::Timeout => return Ok(JobStep::ReorgTimeout),
            ReorgOutcome::Finished(stats) => stats,
        };

        let (mut info, remap) = adjust_column_offsets(&info);
        let moved: Vec<(usize, usize)> = remap
            .into_iter()
            .filter(|(from, to)| from != to)
            .collect();
        set_column_state(&mut info, column_name, SchemaState::Public)?;
        meta.update_table(job.schema_id, &info)?;
        job.schema_state = SchemaState::Public;
        job.state = JobState::Done;
        job.row_count = stats.backfilled;
        tracing::info!(
            "DDL {} column '{}' of {} is public ({} rows backfilled, offsets moved {:?})",
            job.id,
            column_name,
            info.name,
            stats.backfilled,
            moved
        );
        Ok(JobStep::Finished(JobState::Done))
    }
}

fn set_column_state(info: &mut TableInfo, name: &str, state: SchemaState) -> FalconResult<()> {
    let col = info
        .find_column_mut(name)
        .ok_or_else(|| DdlError::NoSuchColumn(name.to_string()))?;
    col.state = state;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_common::datum::Datum;
    use falcon_common::job::ColumnPosition;
    use falcon_common::types::{ColumnId, DataType, JobId, SchemaId, TableId};
    use falcon_storage::MemStorage;

    const SCHEMA: SchemaId = SchemaId(1);
    const TABLE: TableId = TableId(42);

    fn config(owner: &str) -> DdlConfig {
        DdlConfig {
            owner_id: owner.into(),
            reorg_wait_timeout_ms: 10_000,
            ..Default::default()
        }
    }

    fn ab() -> TableInfo {
        TableInfo::new(
            TABLE,
            "t",
            vec![("a", DataType::Int64), ("b", DataType::Int64)],
        )
    }

    struct Fixture {
        store: Arc<MemStorage>,
        worker: DdlWorker,
    }

    impl Fixture {
        fn new(rows: i64) -> Self {
            Self::with_config(rows, config("w1"))
        }

        fn with_config(rows: i64, ddl: DdlConfig) -> Self {
            let store = Arc::new(MemStorage::new());
            let table = Table::new(ab());
            let mut txn = store.begin().unwrap();
            Meta::new(txn.as_mut()).create_table(SCHEMA, &ab()).unwrap();
            for h in 1..=rows {
                table
                    .add_record(txn.as_mut(), h, &[Datum::Int64(h), Datum::Int64(-h)])
                    .unwrap();
            }
            txn.commit().unwrap();
            let dyn_store: Arc<dyn Storage> = store.clone();
            let worker = DdlWorker::new(dyn_store, ddl);
            worker.campaign_owner().unwrap();
            Self { store, worker }
        }

        fn table_info(&self) -> Option<TableInfo> {
            let mut txn = self.store.begin().unwrap();
            Meta::new(txn.as_mut()).get_table(SCHEMA, TABLE).unwrap()
        }

        fn schema_version(&self) -> i64 {
            let mut txn = self.store.begin().unwrap();
            Meta::new(txn.as_mut()).schema_version().unwrap()
        }
    }

    fn add_job(spec: &AlterSpecification) -> Job {
        Job::new(JobId(1), ActionType::AddColumn, SCHEMA, TABLE, spec).unwrap()
    }

    fn add_c() -> AlterSpecification {
        AlterSpecification::add_column("c", DataType::Int64, Some(Datum::Int64(0)))
    }

    #[test]
    fn test_exact_phase_sequence_with_persistence() {
        let fx = Fixture::new(5);
        let mut job = add_job(&add_c());
        let expected = [
            SchemaState::DeleteOnly,
            SchemaState::WriteOnly,
            SchemaState::Reorganization,
        ];
        for (i, state) in expected.iter().enumerate() {
            let v_before = fx.schema_version();
            assert_eq!(
                fx.worker.handle_job(&mut job).unwrap(),
                JobStep::Transitioned(*state)
            );
            assert_eq!(job.schema_state, *state);
            assert_eq!(job.state, JobState::Running);
            assert_eq!(fx.schema_version(), v_before + 1);
            let info = fx.table_info().unwrap();
            let c = info.find_column("c").unwrap();
            assert_eq!(c.state, *state, "step {}", i);
            assert_eq!(c.id, ColumnId(3));
        }
        assert_eq!(job.snapshot_ver, 0);

        let before = fx.store.current_version().unwrap();
        assert_eq!(
            fx.worker.handle_job(&mut job).unwrap(),
            JobStep::Finished(JobState::Done)
        );
        assert_eq!(job.snapshot_ver, before.0);
        assert_eq!(job.schema_state, SchemaState::Public);
        assert_eq!(job.row_count, 5);
        let info = fx.table_info().unwrap();
        assert_eq!(info.find_column("c").unwrap().state, SchemaState::Public);

        // every row now projects the new column
        let table = Table::new(info);
        let mut txn = fx.store.begin().unwrap();
        for h in 1..=5 {
            let row = table.row(txn.as_mut(), h).unwrap().unwrap();
            assert_eq!(row, vec![Datum::Int64(h), Datum::Int64(-h), Datum::Int64(0)]);
        }

        // finished jobs are left alone
        assert_eq!(
            fx.worker.handle_job(&mut job).unwrap(),
            JobStep::Finished(JobState::Done)
        );
        let tracked = fx.worker.tracker().get(job.id).unwrap();
        assert_eq!(tracked.state, JobState::Done);
    }

    #[test]
    fn test_add_after_column_adjusts_offsets_and_index() {
        let fx = Fixture::new(0);
        {
            let mut txn = fx.store.begin().unwrap();
            let mut meta = Meta::new(txn.as_mut());
            meta.gen_schema_version().unwrap();
            let indexed = ab()
                .with_index(falcon_common::types::IndexId(1), "idx_b", &["b"])
                .unwrap();
            meta.update_table(SCHEMA, &indexed).unwrap();
            txn.commit().unwrap();
        }
        let spec = add_c().at(ColumnPosition::After("a".into()));
        let mut job = add_job(&spec);

        fx.worker.handle_job(&mut job).unwrap();
        let info = fx.table_info().unwrap();
        let c = info.find_column("c").unwrap();
        assert_eq!((c.offset, c.temp_offset), (2, 1));
        assert_eq!(info.indices[0].columns[0].offset, 1);

        assert_eq!(fx.worker.run_job(&mut job).unwrap(), JobState::Done);
        let info = fx.table_info().unwrap();
        let names: Vec<&str> = info.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
        let offsets: Vec<usize> = info.columns.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(info.indices[0].columns[0].offset, 2);
    }

    #[test]
    fn test_duplicate_public_column_cancels_without_mutation() {
        let fx = Fixture::new(1);
        let before_info = fx.table_info().unwrap();
        let before_version = fx.schema_version();
        let mut job = add_job(&AlterSpecification::add_column("B", DataType::Int64, None));
        assert_eq!(
            fx.worker.handle_job(&mut job).unwrap(),
            JobStep::Finished(JobState::Cancelled)
        );
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job
            .error
            .as_deref()
            .unwrap()
            .contains("column already exists"));
        assert_eq!(fx.table_info().unwrap(), before_info);
        assert_eq!(fx.schema_version(), before_version);
    }

    #[test]
    fn test_invalid_jobs_are_cancelled() {
        let fx = Fixture::new(0);

        let mut bad_args = Job::with_raw_args(
            JobId(2),
            ActionType::AddColumn,
            SCHEMA,
            TABLE,
            b"{not json".to_vec(),
        );
        assert_eq!(
            fx.worker.handle_job(&mut bad_args).unwrap(),
            JobStep::Finished(JobState::Cancelled)
        );

        let spec = add_c().at(ColumnPosition::After("nope".into()));
        let mut bad_pos = add_job(&spec);
        fx.worker.handle_job(&mut bad_pos).unwrap();
        assert_eq!(bad_pos.state, JobState::Cancelled);
        assert!(bad_pos.error.as_deref().unwrap().contains("nope"));

        let mut no_table =
            Job::new(JobId(3), ActionType::AddColumn, SCHEMA, TableId(999), &add_c()).unwrap();
        fx.worker.handle_job(&mut no_table).unwrap();
        assert_eq!(no_table.state, JobState::Cancelled);

        let mut drop = Job::with_raw_args(
            JobId(4),
            ActionType::DropColumn,
            SCHEMA,
            TABLE,
            Vec::new(),
        );
        fx.worker.handle_job(&mut drop).unwrap();
        assert_eq!(drop.state, JobState::Cancelled);
        assert!(drop.error.as_deref().unwrap().contains("drop column"));

        assert!(fx.table_info().unwrap().find_column("c").is_none());
        assert_eq!(fx.schema_version(), 0);
    }

    #[test]
    fn test_existing_snapshot_version_is_reused() {
        let fx = Fixture::new(3);
        let mut job = add_job(&add_c());
        for _ in 0..3 {
            fx.worker.handle_job(&mut job).unwrap();
        }
        assert_eq!(job.schema_state, SchemaState::Reorganization);
        job.snapshot_ver = fx.store.current_version().unwrap().0;
        let anchored = job.snapshot_ver;

        // a row written with the pre-change layout after the anchor
        let stale = Table::new(ab());
        let mut txn = fx.store.begin().unwrap();
        stale
            .add_record(txn.as_mut(), 100, &[Datum::Int64(100), Datum::Null])
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(
            fx.worker.handle_job(&mut job).unwrap(),
            JobStep::Finished(JobState::Done)
        );
        assert_eq!(job.snapshot_ver, anchored);
        assert_eq!(job.row_count, 3);

        let info = fx.table_info().unwrap();
        let c = info.find_column("c").unwrap().clone();
        let table = Table::new(info);
        let mut txn = fx.store.begin().unwrap();
        assert_eq!(table.col_value(txn.as_mut(), 1, &c).unwrap(), Some(Datum::Int64(0)));
        assert_eq!(table.col_value(txn.as_mut(), 100, &c).unwrap(), None);
    }

    #[test]
    fn test_anchor_below_gc_safepoint_is_moved_forward() {
        let fx = Fixture::new(3);
        let mut job = add_job(&add_c());
        for _ in 0..3 {
            fx.worker.handle_job(&mut job).unwrap();
        }
        job.snapshot_ver = fx.store.current_version().unwrap().0;
        let stale = job.snapshot_ver;

        let mut txn = fx.store.begin().unwrap();
        txn.set(b"unrelated", b"x".to_vec()).unwrap();
        txn.commit().unwrap();
        assert!(fx.store.gc().safepoint.0 > stale);

        assert_eq!(fx.worker.handle_job(&mut job).unwrap(), JobStep::ReorgTimeout);
        assert_eq!(job.schema_state, SchemaState::Reorganization);
        assert!(job.snapshot_ver > stale);
        let anchored = job.snapshot_ver;

        assert_eq!(
            fx.worker.handle_job(&mut job).unwrap(),
            JobStep::Finished(JobState::Done)
        );
        assert_eq!(job.snapshot_ver, anchored);
        assert_eq!(job.row_count, 3);
    }

    #[test]
    fn test_run_job_renews_lease_across_reorg_timeouts() {
        let fx = Fixture::with_config(
            2_000,
            DdlConfig {
                lease_ms: 200,
                reorg_wait_timeout_ms: 0,
                ..config("w1")
            },
        );
        let mut job = add_job(&add_c());
        for _ in 0..3 {
            fx.worker.handle_job(&mut job).unwrap();
        }
        assert_eq!(job.schema_state, SchemaState::Reorganization);
        fx.worker.campaign_owner().unwrap();
        assert_eq!(fx.worker.handle_job(&mut job).unwrap(), JobStep::ReorgTimeout);

        // the lease lapses while the backfill is pending
        std::thread::sleep(std::time::Duration::from_millis(250));
        let err = fx.worker.handle_job(&mut job).unwrap_err();
        assert!(matches!(err, FalconError::Ddl(DdlError::NotOwner { .. })));
        assert_eq!(job.schema_state, SchemaState::Reorganization);

        assert_eq!(fx.worker.run_job(&mut job).unwrap(), JobState::Done);
        assert_eq!(job.row_count, 2_000);
    }

    #[test]
    fn test_run_job_recovers_lapsed_lease_before_first_step() {
        let fx = Fixture::with_config(
            5,
            DdlConfig {
                lease_ms: 50,
                ..config("w1")
            },
        );
        let mut job = add_job(&add_c());
        fx.worker.handle_job(&mut job).unwrap();
        assert_eq!(job.schema_state, SchemaState::DeleteOnly);
        std::thread::sleep(std::time::Duration::from_millis(60));
        assert_eq!(fx.worker.run_job(&mut job).unwrap(), JobState::Done);
        assert_eq!(job.row_count, 5);
    }

    #[test]
    fn test_non_owner_is_rejected_and_job_untouched() {
        let fx = Fixture::new(0);
        let dyn_store: Arc<dyn Storage> = fx.store.clone();
        let intruder = DdlWorker::new(dyn_store, config("w2"));
        assert!(intruder.campaign_owner().is_err());

        let mut job = add_job(&add_c());
        let before = job.clone();
        let err = intruder.handle_job(&mut job).unwrap_err();
        assert!(matches!(err, FalconError::Ddl(DdlError::NotOwner { .. })));
        assert_eq!(job, before);
        assert_eq!(fx.schema_version(), 0);
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let store = Arc::new(MemStorage::new());
        let dyn_store: Arc<dyn Storage> = store.clone();
        let first = DdlWorker::new(
            dyn_store.clone(),
            DdlConfig {
                lease_ms: 1,
                ..config("w1")
            },
        );
        first.campaign_owner().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = DdlWorker::new(dyn_store, config("w2"));
        assert_eq!(second.campaign_owner().unwrap().owner_id, "w2");
        assert!(first.campaign_owner().is_err());
    }

    #[test]
    fn test_resumes_after_crash_mid_job() {
        let fx = Fixture::new(2);
        let mut job = add_job(&add_c());
        fx.worker.handle_job(&mut job).unwrap();
        fx.worker.handle_job(&mut job).unwrap();

        // a fresh worker picks the persisted job up where it was left
        let dyn_store: Arc<dyn Storage> = fx.store.clone();
        let next = DdlWorker::new(dyn_store, config("w1"));
        assert_eq!(next.run_job(&mut job).unwrap(), JobState::Done);
        assert_eq!(job.row_count, 2);
        let info = fx.table_info().unwrap();
        assert_eq!(info.columns.iter().filter(|c| c.name == "c").count(), 1);
    }

    #[test]
    fn test_closed_worker_stops_run_job() {
        let fx = Fixture::new(0);
        let mut job = add_job(&add_c());
        fx.worker.close();
        assert_eq!(fx.worker.run_job(&mut job).unwrap(), JobState::Queueing);
        assert_eq!(job.schema_state, SchemaState::None);
    }
}
