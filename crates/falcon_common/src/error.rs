use thiserror::Error;

use crate::types::{JobId, SchemaId, TableId, TxnId};

/// Convenience alias for `Result<T, FalconError>`.
pub type FalconResult<T> = Result<T, FalconError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad DDL input (unknown column, duplicate column, malformed job args)
/// - `Retryable`   — write conflict, lost ownership; the caller SHOULD retry
/// - `Transient`   — stale snapshot, retry budget exhausted; the caller MAY retry after back-off
/// - `InternalBug` — invariant violation; never repaired automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum FalconError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Meta error: {0}")]
    Meta(#[from] MetaError),

    #[error("DDL error: {0}")]
    Ddl(#[from] DdlError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Key-value layer errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Row shape mismatch: expected {expected} values, got {got}")]
    RowShape { expected: usize, got: usize },

    #[error("Snapshot at {0} is older than the GC safepoint")]
    SnapshotTooOld(u64),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Transaction {0} conflict: key modified after start")]
    WriteConflict(TxnId),

    #[error("Transaction retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

/// Schema metadata errors.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Table {table_id} not found in {schema_id}")]
    TableNotFound {
        schema_id: SchemaId,
        table_id: TableId,
    },

    #[error("Table {table_id} already exists in {schema_id}")]
    TableExists {
        schema_id: SchemaId,
        table_id: TableId,
    },

    #[error("Table update attempted without a new schema version")]
    SchemaVersionNotAllocated,

    #[error("Corrupted meta value at {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

/// Online schema-change errors.
#[derive(Error, Debug)]
pub enum DdlError {
    #[error("Invalid job arguments: {0}")]
    InvalidArgs(String),

    #[error("ADD COLUMN: column already exists: {0}")]
    ColumnExists(String),

    #[error("No such column: {0}")]
    NoSuchColumn(String),

    #[error("Invalid column state: {0}")]
    InvalidColumnState(String),

    #[error("Unsupported DDL action: {0}")]
    UnsupportedAction(String),

    #[error("Not the DDL owner: {worker} (current owner: {owner})")]
    NotOwner { worker: String, owner: String },

    #[error("Reorganization cancelled")]
    ReorgCancelled,

    #[error("Reorganization for {running} still in flight, cannot start {requested}")]
    ReorgInFlight { running: JobId, requested: JobId },
}

// ── FalconError classification & helpers ─────────────────────────────────────

impl FalconError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FalconError::Ddl(DdlError::InvalidArgs(_)) => ErrorKind::UserError,
            FalconError::Ddl(DdlError::ColumnExists(_)) => ErrorKind::UserError,
            FalconError::Ddl(DdlError::NoSuchColumn(_)) => ErrorKind::UserError,
            FalconError::Ddl(DdlError::UnsupportedAction(_)) => ErrorKind::UserError,
            FalconError::Meta(MetaError::TableNotFound { .. }) => ErrorKind::UserError,
            FalconError::Meta(MetaError::TableExists { .. }) => ErrorKind::UserError,
            FalconError::Storage(StorageError::RowShape { .. }) => ErrorKind::UserError,
            FalconError::Config(_) => ErrorKind::UserError,

            FalconError::Txn(TxnError::WriteConflict(_)) => ErrorKind::Retryable,
            FalconError::Ddl(DdlError::NotOwner { .. }) => ErrorKind::Retryable,
            FalconError::Ddl(DdlError::ReorgInFlight { .. }) => ErrorKind::Retryable,

            FalconError::Txn(TxnError::RetryExhausted { .. }) => ErrorKind::Transient,
            FalconError::Ddl(DdlError::ReorgCancelled) => ErrorKind::Transient,
            FalconError::Storage(StorageError::SnapshotTooOld(_)) => ErrorKind::Transient,

            _ => ErrorKind::InternalBug,
        }
    }

    /// Returns true if the operation should be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true if this is a user/input error.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if this is an invariant violation.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }

    /// Returns true for a point read that found no value. Callers that expect
    /// absence match on this instead of failing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FalconError::Storage(StorageError::KeyNotFound))
    }
}
