//! In-memory status of DDL jobs handled by this worker.
//!
//! The tracker is observability only: the durable state of a job is the
//! `Job` record itself. Finished jobs are kept up to a bounded history so
//! status queries can still see recent outcomes.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use falcon_common::job::{ActionType, Job, JobState};
use falcon_common::schema::SchemaState;
use falcon_common::types::{JobId, TableId};

/// Snapshot of one job's progress.
#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub id: JobId,
    pub action: ActionType,
    pub table_id: TableId,
    pub state: JobState,
    pub schema_state: SchemaState,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
    /// Rows whose new column was written by the backfill.
    pub rows_backfilled: u64,
    /// Rows visited by the backfill scan.
    pub rows_scanned: u64,
    pub error: Option<String>,
}

impl TrackedJob {
    fn new(job: &Job) -> Self {
        Self {
            id: job.id,
            action: job.action,
            table_id: job.table_id,
            state: job.state,
            schema_state: job.schema_state,
            started_at: Instant::now(),
            completed_at: None,
            rows_backfilled: 0,
            rows_scanned: 0,
            error: None,
        }
    }

    /// Elapsed time since the job was first seen.
    pub fn elapsed_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started_at).as_millis() as u64
    }
}

pub struct DdlJobTracker {
    jobs: Mutex<HashMap<JobId, TrackedJob>>,
    max_history: usize,
}

impl DdlJobTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_history,
        }
    }

    /// Record the job's current durable state, registering it on first sight.
    pub fn observe(&self, job: &Job) {
        let mut jobs = self.jobs.lock();
        let entry = jobs.entry(job.id).or_insert_with(|| TrackedJob::new(job));
        entry.state = job.state;
        entry.schema_state = job.schema_state;
        if job.error.is_some() {
            entry.error = job.error.clone();
        }
        if job.is_finished() && entry.completed_at.is_none() {
            entry.completed_at = Some(Instant::now());
            entry.rows_backfilled = entry.rows_backfilled.max(job.row_count);
            match job.state {
                JobState::Done => tracing::info!(
                    "DDL {} completed: {} rows backfilled ({}ms)",
                    job.id,
                    entry.rows_backfilled,
                    entry.elapsed_ms()
                ),
                _ => tracing::warn!(
                    "DDL {} cancelled: {}",
                    job.id,
                    job.error.as_deref().unwrap_or("unknown")
                ),
            }
            self.gc_finished(&mut jobs);
        }
    }

    /// Record backfill progress for a running job.
    pub fn record_progress(&self, id: JobId, scanned: u64, backfilled: u64) {
        if let Some(entry) = self.jobs.lock().get_mut(&id) {
            entry.rows_scanned = scanned;
            entry.rows_backfilled = backfilled;
        }
    }

    pub fn get(&self, id: JobId) -> Option<TrackedJob> {
        self.jobs.lock().get(&id).cloned()
    }

    /// Jobs that are neither done nor cancelled.
    pub fn list_active(&self) -> Vec<TrackedJob> {
        let mut active: Vec<TrackedJob> = self
            .jobs
            .lock()
            .values()
            .filter(|j| !j.state.is_finished())
            .cloned()
            .collect();
        active.sort_by_key(|j| j.id);
        active
    }

    pub fn list_all(&self) -> Vec<TrackedJob> {
        let mut all: Vec<TrackedJob> = self.jobs.lock().values().cloned().collect();
        all.sort_by_key(|j| j.id);
        all
    }

    /// Drop the oldest finished jobs beyond `max_history`.
    fn gc_finished(&self, jobs: &mut HashMap<JobId, TrackedJob>) {
        let mut finished: Vec<JobId> = jobs
            .values()
            .filter(|j| j.state.is_finished())
            .map(|j| j.id)
            .collect();
        if finished.len() <= self.max_history {
            return;
        }
        finished.sort();
        let excess = finished.len() - self.max_history;
        for id in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }
}

impl Default for DdlJobTracker {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use falcon_common::types::SchemaId;

    fn job(id: u64) -> Job {
        Job::with_raw_args(
            JobId(id),
            ActionType::AddColumn,
            SchemaId(1),
            TableId(1),
            Vec::new(),
        )
    }

    #[test]
    fn test_job_lifecycle() {
        let tracker = DdlJobTracker::default();
        let mut j = job(1);
        j.state = JobState::Running;
        j.schema_state = SchemaState::Reorganization;
        tracker.observe(&j);
        tracker.record_progress(j.id, 10, 7);

        let t = tracker.get(j.id).unwrap();
        assert_eq!(t.schema_state, SchemaState::Reorganization);
        assert_eq!(t.rows_scanned, 10);
        assert_eq!(t.rows_backfilled, 7);
        assert!(t.completed_at.is_none());
        assert_eq!(tracker.list_active().len(), 1);

        j.state = JobState::Done;
        j.schema_state = SchemaState::Public;
        j.row_count = 7;
        tracker.observe(&j);
        let t = tracker.get(j.id).unwrap();
        assert!(t.completed_at.is_some());
        assert!(tracker.list_active().is_empty());
    }

    #[test]
    fn test_cancelled_job_keeps_error() {
        let tracker = DdlJobTracker::default();
        let mut j = job(2);
        j.state = JobState::Cancelled;
        j.error = Some("column already exists".into());
        tracker.observe(&j);
        let t = tracker.get(j.id).unwrap();
        assert_eq!(t.state, JobState::Cancelled);
        assert_eq!(t.error.as_deref(), Some("column already exists"));
    }

    #[test]
    fn test_history_is_bounded() {
        let tracker = DdlJobTracker::new(2);
        let mut running = job(100);
        running.state = JobState::Running;
        tracker.observe(&running);
        for id in 1..=5 {
            let mut j = job(id);
            j.state = JobState::Done;
            tracker.observe(&j);
        }
        let ids: Vec<JobId> = tracker.list_all().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![JobId(4), JobId(5), JobId(100)]);
    }

    #[test]
    fn test_progress_for_unknown_job_is_ignored() {
        let tracker = DdlJobTracker::default();
        tracker.record_progress(JobId(9), 1, 1);
        assert!(tracker.get(JobId(9)).is_none());
    }
}
