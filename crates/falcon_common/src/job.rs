//! DDL job record and ALTER TABLE arguments.
//!
//! A `Job` is created once per DDL statement by the job queue and handed to
//! the DDL worker on every invocation. The worker mutates it in place; the
//! owner of the queue persists it after each call.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datum::Datum;
use crate::error::{DdlError, FalconResult};
use crate::schema::SchemaState;
use crate::types::{DataType, JobId, SchemaId, TableId};

/// Lifecycle of a DDL job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobState {
    #[default]
    Queueing,
    Running,
    Done,
    Cancelled,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Done | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queueing => write!(f, "queueing"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The kind of DDL a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    AddColumn,
    DropColumn,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::AddColumn => write!(f, "add column"),
            ActionType::DropColumn => write!(f, "drop column"),
        }
    }
}

/// A persisted DDL job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub action: ActionType,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    /// Encoded arguments; for `AddColumn` an `AlterSpecification`.
    pub args: Vec<u8>,
    pub state: JobState,
    /// Mirrors the phase of the object being changed.
    pub schema_state: SchemaState,
    /// MVCC version the reorganization reads at; 0 means not anchored yet.
    pub snapshot_ver: u64,
    /// Rows backfilled by the reorganization.
    #[serde(default)]
    pub row_count: u64,
    /// Error that cancelled the job, if any.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new<A: Serialize>(
        id: JobId,
        action: ActionType,
        schema_id: SchemaId,
        table_id: TableId,
        args: &A,
    ) -> FalconResult<Self> {
        let args = serde_json::to_vec(args).map_err(|e| DdlError::InvalidArgs(e.to_string()))?;
        Ok(Self::with_raw_args(id, action, schema_id, table_id, args))
    }

    /// Build a job around already-encoded arguments.
    pub fn with_raw_args(
        id: JobId,
        action: ActionType,
        schema_id: SchemaId,
        table_id: TableId,
        args: Vec<u8>,
    ) -> Self {
        Self {
            id,
            action,
            schema_id,
            table_id,
            args,
            state: JobState::Queueing,
            schema_state: SchemaState::None,
            snapshot_ver: 0,
            row_count: 0,
            error: None,
        }
    }

    pub fn decode_args<A: DeserializeOwned>(&self) -> FalconResult<A> {
        serde_json::from_slice(&self.args)
            .map_err(|e| DdlError::InvalidArgs(e.to_string()).into())
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {}.{} [state={}, schema_state={}, snapshot_ver={}]",
            self.id,
            self.action,
            self.schema_id,
            self.table_id,
            self.state,
            self.schema_state,
            self.snapshot_ver
        )
    }
}

/// Where an added column lands in the logical column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ColumnPosition {
    /// Append after the last column.
    #[default]
    End,
    First,
    After(String),
}

/// Definition of the column being added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
    /// Precomputed default; `None` backfills NULL.
    #[serde(default)]
    pub default_value: Option<Datum>,
}

/// Parsed `ALTER TABLE ... ADD COLUMN` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlterSpecification {
    pub column: ColumnSpec,
    #[serde(default)]
    pub position: ColumnPosition,
}

impl AlterSpecification {
    pub fn add_column(name: &str, data_type: DataType, default_value: Option<Datum>) -> Self {
        Self {
            column: ColumnSpec {
                name: name.to_string(),
                data_type,
                default_value,
            },
            position: ColumnPosition::End,
        }
    }

    pub fn at(mut self, position: ColumnPosition) -> Self {
        self.position = position;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_args_decode() {
        let spec = AlterSpecification::add_column("c", DataType::Int64, Some(Datum::Int64(5)))
            .at(ColumnPosition::After("a".into()));
        let job = Job::new(JobId(1), ActionType::AddColumn, SchemaId(1), TableId(2), &spec)
            .unwrap();
        assert_eq!(job.state, JobState::Queueing);
        assert_eq!(job.snapshot_ver, 0);
        let back: AlterSpecification = job.decode_args().unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_malformed_args_are_invalid_args() {
        let job = Job::with_raw_args(
            JobId(1),
            ActionType::AddColumn,
            SchemaId(1),
            TableId(2),
            b"{not json".to_vec(),
        );
        let err = job.decode_args::<AlterSpecification>().unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_finished_states() {
        assert!(!JobState::Running.is_finished());
        assert!(JobState::Done.is_finished());
        assert!(JobState::Cancelled.is_finished());
    }
}
