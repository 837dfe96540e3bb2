//! Online ADD COLUMN for tables that stay readable and writable throughout.
//!
//! - [`worker`]: the job state machine driving a column through its phases
//! - [`mutator`]: pure `TableInfo` transformations
//! - [`scanner`] / [`backfill`]: snapshot scan and per-row default backfill
//! - [`reorg`]: bounded wait on the background backfill
//! - [`owner`]: DDL owner lease
//! - [`tracker`]: in-memory job status

pub mod backfill;
pub mod mutator;
pub mod owner;
pub mod reorg;
pub mod scanner;
pub mod tracker;
pub mod worker;

pub use backfill::{BackfillStats, BackfillTask};
pub use reorg::{ReorgOutcome, ReorgRunner, ReorgSignal};
pub use tracker::DdlJobTracker;
pub use worker::{DdlWorker, JobStep};
