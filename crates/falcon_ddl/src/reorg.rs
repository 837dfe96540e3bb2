//! Background runner for the reorganization (backfill) phase.
//!
//! The backfill runs on a dedicated thread so a state-machine step can wait
//! for it with a deadline. A step that times out returns while the backfill
//! keeps going; the next step for the same job waits on that task again
//! instead of starting a second one. At most one task is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use falcon_common::error::{DdlError, FalconError, FalconResult};
use falcon_common::types::JobId;

use crate::backfill::BackfillStats;

/// Cooperative quit flag shared with the running backfill.
#[derive(Debug, Clone, Default)]
pub struct ReorgSignal {
    quit: Arc<AtomicBool>,
}

impl ReorgSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// `Err(ReorgCancelled)` once cancellation was requested.
    pub fn check(&self) -> FalconResult<()> {
        if self.is_cancelled() {
            Err(DdlError::ReorgCancelled.into())
        } else {
            Ok(())
        }
    }
}

/// Result of one bounded wait on the reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgOutcome {
    Finished(BackfillStats),
    /// Still running (or cancelled); the job should be re-enqueued.
    Timeout,
}

struct InFlight {
    job_id: JobId,
    rx: Receiver<FalconResult<BackfillStats>>,
    handle: JoinHandle<()>,
}

impl InFlight {
    fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("DDL {} reorg thread panicked", self.job_id);
        }
    }
}

pub struct ReorgRunner {
    signal: ReorgSignal,
    in_flight: Mutex<Option<InFlight>>,
}

impl Default for ReorgRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorgRunner {
    pub fn new() -> Self {
        Self {
            signal: ReorgSignal::new(),
            in_flight: Mutex::new(None),
        }
    }

    /// Whether a task is still in flight.
    pub fn is_running(&self) -> bool {
        self.in_flight
            .lock()
            .as_ref()
            .is_some_and(|f| !f.handle.is_finished())
    }

    /// Job owning the in-flight task, if any.
    pub fn running_job(&self) -> Option<JobId> {
        self.in_flight.lock().as_ref().map(|f| f.job_id)
    }

    /// Start `work` for `job_id` (unless it is already in flight) and wait at
    /// most `timeout` for it to finish.
    ///
    /// A cancelled task reports `Timeout`; every other task error is returned
    /// as is. A task for a different job still in flight is
    /// `DdlError::ReorgInFlight`.
    pub fn run<F>(&self, job_id: JobId, timeout: Duration, work: F) -> FalconResult<ReorgOutcome>
    where
        F: FnOnce(ReorgSignal) -> FalconResult<BackfillStats> + Send + 'static,
    {
        let mut slot = self.in_flight.lock();
        if let Some(running) = slot.as_ref() {
            if running.job_id != job_id {
                return Err(DdlError::ReorgInFlight {
                    running: running.job_id,
                    requested: job_id,
                }
                .into());
            }
            tracing::debug!("DDL {} waiting on in-flight reorg", job_id);
        } else {
            if self.signal.is_cancelled() {
                tracing::warn!("DDL {} reorg not started: runner closed", job_id);
                return Ok(ReorgOutcome::Timeout);
            }
            let (tx, rx) = mpsc::channel();
            let signal = self.signal.clone();
            let handle = std::thread::Builder::new()
                .name("falcon-ddl-reorg".into())
                .spawn(move || {
                    // The receiver is gone only if the runner was dropped.
                    let _ = tx.send(work(signal));
                })
                .map_err(|e| {
                    tracing::error!(
                        component = "ddl-reorg",
                        error = %e,
                        "failed to spawn reorg thread"
                    );
                    FalconError::Internal(format!("failed to spawn reorg thread: {}", e))
                })?;
            *slot = Some(InFlight { job_id, rx, handle });
        }

        let received = match slot.as_ref() {
            Some(running) => running.rx.recv_timeout(timeout),
            None => Err(RecvTimeoutError::Disconnected),
        };
        match received {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    "DDL {} reorg still running after {}ms",
                    job_id,
                    timeout.as_millis()
                );
                Ok(ReorgOutcome::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(done) = slot.take() {
                    done.join();
                }
                Err(FalconError::Internal(format!(
                    "reorg for {} exited without a result",
                    job_id
                )))
            }
            Ok(result) => {
                if let Some(done) = slot.take() {
                    done.join();
                }
                match result {
                    Ok(stats) => Ok(ReorgOutcome::Finished(stats)),
                    Err(FalconError::Ddl(DdlError::ReorgCancelled)) => {
                        tracing::warn!("DDL {} reorg cancelled", job_id);
                        Ok(ReorgOutcome::Timeout)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Ask the in-flight task to stop and wait for it. No new task starts
    /// afterwards.
    pub fn close(&self) {
        self.signal.cancel();
        if let Some(running) = self.in_flight.lock().take() {
            running.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_cancelled()
    }
}

impl Drop for ReorgRunner {
    fn drop(&mut self) {
        self.close();
    }
}
