//! Ordered scan over one table's record keys at a fixed MVCC version.
//!
//! The only resumption state is the next seek key. The scanner yields every
//! visible key under the table prefix; callers that handle a whole row at a
//! time call [`RowScanner::seek_past_row`] to skip its remaining column keys.

use falcon_common::error::FalconResult;
use falcon_common::types::Timestamp;
use falcon_storage::codec::{decode_key, encode_key, prefix_next};
use falcon_storage::{Snapshot, Storage, Table};

pub struct RowScanner {
    snapshot: Box<dyn Snapshot>,
    prefix: Vec<u8>,
    /// Encoded key the next seek starts at; `None` once exhausted.
    cursor: Option<Vec<u8>>,
}

impl RowScanner {
    /// Acquire a snapshot at `version` and position at the table's first
    /// record key. The snapshot is released when the scanner is dropped.
    pub fn open(store: &dyn Storage, table: &Table, version: Timestamp) -> FalconResult<Self> {
        let snapshot = store.get_snapshot(version)?;
        Ok(Self {
            snapshot,
            prefix: table.key_prefix().to_vec(),
            cursor: Some(encode_key(&table.first_key())),
        })
    }

    pub fn version(&self) -> Timestamp {
        self.snapshot.version()
    }

    /// Continue after every key of the row whose lock key is `lock_key`.
    pub fn seek_past_row(&mut self, lock_key: &[u8]) {
        if self.cursor.is_some() {
            self.cursor = Some(encode_key(&prefix_next(lock_key)));
        }
    }

    fn advance(&mut self, start: Vec<u8>) -> FalconResult<Option<Vec<u8>>> {
        let Some((encoded, _)) = self.snapshot.seek(&start)? else {
            return Ok(None);
        };
        let key = decode_key(&encoded)?;
        if !key.starts_with(&self.prefix) {
            return Ok(None);
        }
        let mut next = encoded;
        next.push(0);
        self.cursor = Some(next);
        Ok(Some(key))
    }
}

impl Iterator for RowScanner {
    type Item = FalconResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor.take()?;
        self.advance(start).transpose()
    }
}
