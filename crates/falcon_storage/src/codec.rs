//! Key layout and memcomparable key encoding.
//!
//! ## Row key layout
//!
//! ```text
//!   row (lock) key : 't' [table_id: u64 BE] '_r' [handle: i64 sign-flipped BE]
//!   column key     : <row key> [column_id: u64 BE]
//! ```
//!
//! The row key doubles as the row's lock key and existence marker; every
//! column key of the row sorts after it and before the next row's key, so
//! `prefix_next(row_key)` is the first key of the following row.
//!
//! ## MVCC key encoding
//!
//! The store orders keys by their memcomparable encoding: 8-byte groups, each
//! followed by a marker byte `0xFF - pad`, the last group zero-padded. The
//! encoding preserves byte order and is self-delimiting.

use falcon_common::error::StorageError;
use falcon_common::types::{ColumnId, TableId};

const ENC_GROUP_SIZE: usize = 8;
const ENC_MARKER: u8 = 0xFF;
const ENC_PAD: u8 = 0x00;

pub const TABLE_PREFIX: u8 = b't';
pub const RECORD_SEP: &[u8; 2] = b"_r";

/// `'t' + table_id + "_r"`.
pub const RECORD_PREFIX_LEN: usize = 1 + 8 + RECORD_SEP.len();
pub const ROW_KEY_LEN: usize = RECORD_PREFIX_LEN + 8;

const SIGN_FLIP_MASK: u64 = 1u64 << 63;

fn encode_i64_ordered(value: i64) -> [u8; 8] {
    (value as u64 ^ SIGN_FLIP_MASK).to_be_bytes()
}

fn decode_i64_ordered(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_FLIP_MASK) as i64
}

/// Encode a raw key into the store's ordered key space.
pub fn encode_key(raw: &[u8]) -> Vec<u8> {
    let groups = raw.len() / ENC_GROUP_SIZE + 1;
    let mut out = Vec::with_capacity(groups * (ENC_GROUP_SIZE + 1));
    let mut chunks = raw.chunks_exact(ENC_GROUP_SIZE);
    for chunk in &mut chunks {
        out.extend_from_slice(chunk);
        out.push(ENC_MARKER);
    }
    let tail = chunks.remainder();
    let pad = ENC_GROUP_SIZE - tail.len();
    out.extend_from_slice(tail);
    out.resize(out.len() + pad, ENC_PAD);
    out.push(ENC_MARKER - pad as u8);
    out
}

/// Inverse of [`encode_key`]. Malformed input is an `InvalidKey` error.
pub fn decode_key(encoded: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut rest = encoded;
    loop {
        if rest.len() < ENC_GROUP_SIZE + 1 {
            return Err(StorageError::InvalidKey(format!(
                "truncated group in encoded key of {} bytes",
                encoded.len()
            )));
        }
        let (group, tail) = rest.split_at(ENC_GROUP_SIZE + 1);
        let pad = (ENC_MARKER - group[ENC_GROUP_SIZE]) as usize;
        if pad > ENC_GROUP_SIZE {
            return Err(StorageError::InvalidKey(format!(
                "bad group marker {:#04x}",
                group[ENC_GROUP_SIZE]
            )));
        }
        let real = ENC_GROUP_SIZE - pad;
        out.extend_from_slice(&group[..real]);
        if pad == 0 {
            rest = tail;
            continue;
        }
        if group[real..ENC_GROUP_SIZE].iter().any(|&b| b != ENC_PAD) {
            return Err(StorageError::InvalidKey("non-zero padding".into()));
        }
        if !tail.is_empty() {
            return Err(StorageError::InvalidKey(format!(
                "{} trailing bytes after final group",
                tail.len()
            )));
        }
        return Ok(out);
    }
}

/// Prefix shared by every row key of a table.
pub fn record_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(RECORD_PREFIX_LEN);
    key.push(TABLE_PREFIX);
    key.extend_from_slice(&table_id.0.to_be_bytes());
    key.extend_from_slice(RECORD_SEP);
    key
}

/// The row's lock / existence key.
pub fn row_key(table_id: TableId, handle: i64) -> Vec<u8> {
    let mut key = record_prefix(table_id);
    key.extend_from_slice(&encode_i64_ordered(handle));
    key
}

/// Key of one column cell of a row.
pub fn column_key(table_id: TableId, handle: i64, column_id: ColumnId) -> Vec<u8> {
    let mut key = row_key(table_id, handle);
    key.extend_from_slice(&column_id.0.to_be_bytes());
    key
}

/// Extract the row handle from a row key or column key.
pub fn decode_handle_from_row_key(key: &[u8]) -> Result<i64, StorageError> {
    if key.len() < ROW_KEY_LEN {
        return Err(StorageError::InvalidKey(format!(
            "row key too short: {} bytes",
            key.len()
        )));
    }
    if key[0] != TABLE_PREFIX || &key[9..RECORD_PREFIX_LEN] != RECORD_SEP {
        return Err(StorageError::InvalidKey("not a record key".into()));
    }
    let mut handle = [0u8; 8];
    handle.copy_from_slice(&key[RECORD_PREFIX_LEN..ROW_KEY_LEN]);
    Ok(decode_i64_ordered(handle))
}

/// Smallest key greater than every key that starts with `key`.
///
/// A key of all `0xFF` bytes has no such bound; the key with a zero byte
/// appended is returned instead (the next key in plain byte order).
pub fn prefix_next(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] == u8::MAX {
            next[i] = 0;
        } else {
            next[i] += 1;
            next.truncate(i + 1);
            return next;
        }
    }
    let mut next = key.to_vec();
    next.push(0);
    next
}
