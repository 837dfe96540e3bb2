//! In-memory MVCC implementation of the [`Storage`] interfaces.
//!
//! Design:
//! - Keys are held in their encoded order in a `BTreeMap`, each with a
//!   [`VersionChain`] of committed versions.
//! - Transactions are optimistic: reads go to the chain at `start_ts`,
//!   writes are buffered and installed at commit under a single commit lock
//!   after checking that no written or locked key changed since `start_ts`.
//!   Locked keys are validated only; locking alone never creates a version.
//! - Every open snapshot and transaction registers its read version; GC
//!   never reclaims a version that a registered reader can still see.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use falcon_common::config::TxnConfig;
use falcon_common::error::{FalconResult, StorageError, TxnError};
use falcon_common::types::{Timestamp, TxnId};

use crate::codec::encode_key;
use crate::kv::{Snapshot, Storage, Transaction};
use crate::mvcc::VersionChain;

/// Version the store starts at. Commits get versions strictly above it, so
/// a zero version never names real data.
const BOOTSTRAP_TS: u64 = 1;

struct StoreInner {
    data: RwLock<BTreeMap<Vec<u8>, Arc<VersionChain>>>,
    /// Latest committed version; published after the commit's versions are
    /// installed.
    last_ts: AtomicU64,
    next_txn_id: AtomicU64,
    commit_lock: Mutex<()>,
    /// Serializes reader registration against safepoint advancement.
    gc_lock: Mutex<()>,
    /// read version → number of open readers at it.
    active_readers: DashMap<u64, usize>,
    gc_safepoint: AtomicU64,
    txn_config: TxnConfig,
}

/// Registration of an open reader; dropping it releases the read version.
struct ReaderGuard {
    inner: Arc<StoreInner>,
    ts: u64,
}

impl ReaderGuard {
    fn register(inner: &Arc<StoreInner>, ts: Option<Timestamp>) -> FalconResult<Self> {
        let _gc = inner.gc_lock.lock();
        let ts = match ts {
            Some(ts) => ts.0,
            None => inner.last_ts.load(Ordering::Acquire),
        };
        if ts < inner.gc_safepoint.load(Ordering::Acquire) {
            return Err(StorageError::SnapshotTooOld(ts).into());
        }
        *inner.active_readers.entry(ts).or_insert(0) += 1;
        Ok(Self {
            inner: Arc::clone(inner),
            ts,
        })
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.inner.active_readers.get_mut(&self.ts) {
            *count -= 1;
        }
        self.inner
            .active_readers
            .remove_if(&self.ts, |_, count| *count == 0);
    }
}

/// Result of a GC sweep over the whole store.
#[derive(Debug, Clone, Default)]
pub struct GcSweepResult {
    pub safepoint: Timestamp,
    pub reclaimed_versions: u64,
    pub reclaimed_bytes: u64,
    pub removed_keys: u64,
}

/// In-memory MVCC store.
#[derive(Clone)]
pub struct MemStorage {
    inner: Arc<StoreInner>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        Self::with_config(TxnConfig::default())
    }

    pub fn with_config(txn_config: TxnConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                data: RwLock::new(BTreeMap::new()),
                last_ts: AtomicU64::new(BOOTSTRAP_TS),
                next_txn_id: AtomicU64::new(1),
                commit_lock: Mutex::new(()),
                gc_lock: Mutex::new(()),
                active_readers: DashMap::new(),
                gc_safepoint: AtomicU64::new(0),
                txn_config,
            }),
        }
    }

    /// Number of open snapshots and transactions.
    pub fn active_reader_count(&self) -> usize {
        self.inner.active_readers.iter().map(|e| *e.value()).sum()
    }

    /// Versions stored for a raw key, for observability and tests.
    pub fn version_count(&self, key: &[u8]) -> usize {
        self.inner
            .data
            .read()
            .get(&encode_key(key))
            .map_or(0, |c| c.version_chain_len())
    }

    /// Reclaim versions no registered reader can see.
    ///
    /// safepoint = min(oldest open reader, latest committed version)
    pub fn gc(&self) -> GcSweepResult {
        let safepoint = {
            let _gc = self.inner.gc_lock.lock();
            let current = self.inner.last_ts.load(Ordering::Acquire);
            let oldest_reader = self
                .inner
                .active_readers
                .iter()
                .map(|e| *e.key())
                .min()
                .unwrap_or(current);
            let sp = oldest_reader.min(current);
            self.inner.gc_safepoint.fetch_max(sp, Ordering::AcqRel);
            Timestamp(sp)
        };

        let mut result = GcSweepResult {
            safepoint,
            ..Default::default()
        };
        let mut dead = Vec::new();
        {
            let data = self.inner.data.read();
            for (key, chain) in data.iter() {
                let r = chain.gc(safepoint);
                result.reclaimed_versions += r.reclaimed_versions;
                result.reclaimed_bytes += r.reclaimed_bytes;
                if chain.is_dead_at(safepoint) {
                    dead.push(key.clone());
                }
            }
        }
        if !dead.is_empty() {
            let _commit = self.inner.commit_lock.lock();
            let mut data = self.inner.data.write();
            for key in dead {
                if data.get(&key).is_some_and(|c| c.is_dead_at(safepoint)) {
                    data.remove(&key);
                    result.removed_keys += 1;
                }
            }
        }
        if result.reclaimed_versions > 0 {
            tracing::debug!(
                "GC sweep: safepoint={}, reclaimed={} versions, {}B, removed {} keys",
                safepoint.0,
                result.reclaimed_versions,
                result.reclaimed_bytes,
                result.removed_keys
            );
        }
        result
    }
}

impl Storage for MemStorage {
    fn begin(&self) -> FalconResult<Box<dyn Transaction>> {
        let guard = ReaderGuard::register(&self.inner, None)?;
        let id = TxnId(self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed));
        Ok(Box::new(MemTxn {
            inner: Arc::clone(&self.inner),
            id,
            start_ts: Timestamp(guard.ts),
            writes: BTreeMap::new(),
            locks: BTreeSet::new(),
            _reader: guard,
        }))
    }

    fn current_version(&self) -> FalconResult<Timestamp> {
        Ok(Timestamp(self.inner.last_ts.load(Ordering::Acquire)))
    }

    fn get_snapshot(&self, version: Timestamp) -> FalconResult<Box<dyn Snapshot>> {
        let guard = ReaderGuard::register(&self.inner, Some(version))?;
        Ok(Box::new(MemSnapshot {
            inner: Arc::clone(&self.inner),
            version,
            _reader: guard,
        }))
    }

    fn txn_config(&self) -> TxnConfig {
        self.inner.txn_config
    }
}

/// Read view of a [`MemStorage`] at a fixed version.
pub struct MemSnapshot {
    inner: Arc<StoreInner>,
    version: Timestamp,
    _reader: ReaderGuard,
}

impl Snapshot for MemSnapshot {
    fn version(&self) -> Timestamp {
        self.version
    }

    fn get(&self, encoded_key: &[u8]) -> FalconResult<Vec<u8>> {
        self.inner
            .data
            .read()
            .get(encoded_key)
            .and_then(|c| c.read_at(self.version))
            .ok_or_else(|| StorageError::KeyNotFound.into())
    }

    fn seek(&self, encoded_start: &[u8]) -> FalconResult<Option<(Vec<u8>, Vec<u8>)>> {
        let data = self.inner.data.read();
        let range = data.range::<[u8], _>((Bound::Included(encoded_start), Bound::Unbounded));
        for (key, chain) in range {
            if let Some(value) = chain.read_at(self.version) {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

/// Optimistic transaction over a [`MemStorage`].
pub struct MemTxn {
    inner: Arc<StoreInner>,
    id: TxnId,
    start_ts: Timestamp,
    /// encoded key → new value (None = delete).
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    locks: BTreeSet<Vec<u8>>,
    _reader: ReaderGuard,
}

impl Transaction for MemTxn {
    fn id(&self) -> TxnId {
        self.id
    }

    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn get(&mut self, key: &[u8]) -> FalconResult<Vec<u8>> {
        let enc = encode_key(key);
        let value = match self.writes.get(&enc) {
            Some(buffered) => buffered.clone(),
            None => self
                .inner
                .data
                .read()
                .get(&enc)
                .and_then(|c| c.read_at(self.start_ts)),
        };
        value.ok_or_else(|| StorageError::KeyNotFound.into())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> FalconResult<()> {
        self.writes.insert(encode_key(key), Some(value));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> FalconResult<()> {
        self.writes.insert(encode_key(key), None);
        Ok(())
    }

    fn lock_keys(&mut self, keys: &[&[u8]]) -> FalconResult<()> {
        for key in keys {
            self.locks.insert(encode_key(key));
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> FalconResult<Timestamp> {
        let MemTxn {
            inner,
            id,
            start_ts,
            writes,
            locks,
            _reader,
        } = *self;
        if writes.is_empty() && locks.is_empty() {
            return Ok(start_ts);
        }

        let _commit = inner.commit_lock.lock();
        let commit_ts = Timestamp(inner.last_ts.load(Ordering::Acquire) + 1);
        {
            let data = inner.data.read();
            for key in writes.keys().chain(locks.iter()) {
                if data
                    .get(key)
                    .is_some_and(|c| c.has_committed_write_after(start_ts))
                {
                    tracing::debug!("{} write conflict at {}", id, start_ts);
                    return Err(TxnError::WriteConflict(id).into());
                }
            }
        }
        if writes.is_empty() {
            return Ok(start_ts);
        }
        {
            let mut data = inner.data.write();
            for (key, value) in writes {
                data.entry(key)
                    .or_insert_with(|| Arc::new(VersionChain::new()))
                    .prepend(commit_ts, value);
            }
        }
        inner.last_ts.store(commit_ts.0, Ordering::Release);
        Ok(commit_ts)
    }

    fn rollback(self: Box<Self>) {
        tracing::trace!("{} rolled back ({} buffered writes)", self.id, self.writes.len());
    }
}
