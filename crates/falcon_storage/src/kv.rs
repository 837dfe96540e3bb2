//! Transactional key-value interfaces consumed by the schema-change core.
//!
//! Two key spaces are involved:
//! - [`Transaction`] works on raw keys (row keys, meta keys) against the live
//!   store.
//! - [`Snapshot`] is the MVCC read view and works on keys in the store's
//!   encoded order (`codec::encode_key`), which is what a versioned iterator
//!   hands back.

use falcon_common::config::TxnConfig;
use falcon_common::error::{FalconResult, TxnError};
use falcon_common::types::{Timestamp, TxnId};

/// A transactional, multi-versioned key-value store.
pub trait Storage: Send + Sync {
    /// Start an optimistic transaction reading at the current version.
    fn begin(&self) -> FalconResult<Box<dyn Transaction>>;

    /// Latest committed version of the store.
    fn current_version(&self) -> FalconResult<Timestamp>;

    /// Read-only view at `version`. Released when dropped.
    fn get_snapshot(&self, version: Timestamp) -> FalconResult<Box<dyn Snapshot>>;

    /// Retry policy for `run_in_new_txn`.
    fn txn_config(&self) -> TxnConfig {
        TxnConfig::default()
    }
}

/// Immutable view of the store at a fixed version, keyed by encoded keys.
pub trait Snapshot: Send + Sync {
    fn version(&self) -> Timestamp;

    /// Value of `encoded_key` as of the snapshot version.
    fn get(&self, encoded_key: &[u8]) -> FalconResult<Vec<u8>>;

    /// First entry visible at the snapshot version whose encoded key is
    /// `>= encoded_start`, or `None` when the key space is exhausted.
    fn seek(&self, encoded_start: &[u8]) -> FalconResult<Option<(Vec<u8>, Vec<u8>)>>;
}

/// An atomic read/modify/write unit over the live store.
///
/// Writes are buffered and become visible all at once on `commit`. A
/// transaction dropped without commit is rolled back.
pub trait Transaction: Send {
    fn id(&self) -> TxnId;

    fn start_ts(&self) -> Timestamp;

    /// Read a key, seeing this transaction's own writes.
    /// Absence is `StorageError::KeyNotFound`.
    fn get(&mut self, key: &[u8]) -> FalconResult<Vec<u8>>;

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> FalconResult<()>;

    fn delete(&mut self, key: &[u8]) -> FalconResult<()>;

    /// Lock keys for the lifetime of the transaction: commit fails with a
    /// write conflict if any of them changed after this transaction started.
    fn lock_keys(&mut self, keys: &[&[u8]]) -> FalconResult<()>;

    /// Commit all buffered writes; returns the commit version.
    fn commit(self: Box<Self>) -> FalconResult<Timestamp>;

    fn rollback(self: Box<Self>);
}

/// Run `f` inside a fresh transaction, committing on success and rolling back
/// on failure. With `retryable`, retryable failures (write conflicts) of
/// either `f` or the commit restart the whole closure in a new transaction,
/// following the store's [`TxnConfig`].
pub fn run_in_new_txn<T, F>(store: &dyn Storage, retryable: bool, mut f: F) -> FalconResult<T>
where
    F: FnMut(&mut dyn Transaction) -> FalconResult<T>,
{
    let config = store.txn_config();
    let max_attempts = if retryable {
        config.max_retries.max(1)
    } else {
        1
    };

    for attempt in 1..=max_attempts {
        let mut txn = store.begin()?;
        let txn_id = txn.id();
        let err = match f(txn.as_mut()) {
            Ok(value) => match txn.commit() {
                Ok(_) => return Ok(value),
                Err(e) => e,
            },
            Err(e) => {
                txn.rollback();
                e
            }
        };
        if !(retryable && err.is_retryable()) {
            return Err(err);
        }
        tracing::warn!(
            "{} attempt {}/{} failed, retrying: {}",
            txn_id,
            attempt,
            max_attempts,
            err
        );
        if attempt < max_attempts {
            std::thread::sleep(config.backoff(attempt));
        }
    }

    Err(TxnError::RetryExhausted {
        attempts: max_attempts,
    }
    .into())
}
