//! Row-level access to one table's records under a given schema snapshot.
//!
//! Each row is stored as a row key holding an empty existence marker plus one
//! column key per stored cell. Which columns a write touches depends on the
//! column's phase: inserts populate writable columns, deletes clean up
//! deletable ones, and reads project public ones only.

use std::sync::Arc;

use falcon_common::datum::Datum;
use falcon_common::error::{FalconResult, StorageError};
use falcon_common::schema::{ColumnInfo, TableInfo};

use crate::codec::{column_key, record_prefix, row_key};
use crate::kv::Transaction;

/// Handle on a table's records, bound to one `TableInfo` version.
#[derive(Debug, Clone)]
pub struct Table {
    info: Arc<TableInfo>,
    record_prefix: Vec<u8>,
}

impl Table {
    pub fn new(info: TableInfo) -> Self {
        let record_prefix = record_prefix(info.id);
        Self {
            info: Arc::new(info),
            record_prefix,
        }
    }

    pub fn meta(&self) -> &TableInfo {
        &self.info
    }

    /// Smallest row key of the table.
    pub fn first_key(&self) -> Vec<u8> {
        row_key(self.info.id, i64::MIN)
    }

    /// Prefix shared by every record key of the table.
    pub fn key_prefix(&self) -> &[u8] {
        &self.record_prefix
    }

    /// The row key for `column = None`, otherwise the cell key.
    pub fn record_key(&self, handle: i64, column: Option<&ColumnInfo>) -> Vec<u8> {
        match column {
            Some(col) => column_key(self.info.id, handle, col.id),
            None => row_key(self.info.id, handle),
        }
    }

    pub fn row_exists(&self, txn: &mut dyn Transaction, handle: i64) -> FalconResult<bool> {
        match txn.get(&self.record_key(handle, None)) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write one cell at a precomputed cell key.
    pub fn set_col_value(
        &self,
        txn: &mut dyn Transaction,
        key: &[u8],
        value: &Datum,
    ) -> FalconResult<()> {
        txn.set(key, value.encode()?)
    }

    /// Stored value of one cell, `None` if the cell was never written.
    pub fn col_value(
        &self,
        txn: &mut dyn Transaction,
        handle: i64,
        column: &ColumnInfo,
    ) -> FalconResult<Option<Datum>> {
        match txn.get(&self.record_key(handle, Some(column))) {
            Ok(raw) => Ok(Some(Datum::decode(&raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Insert (or overwrite) a row. `values` follow the public columns in
    /// logical order; writable columns that are not yet public receive their
    /// default value.
    pub fn add_record(
        &self,
        txn: &mut dyn Transaction,
        handle: i64,
        values: &[Datum],
    ) -> FalconResult<()> {
        let public = self.info.public_columns().count();
        if values.len() != public {
            return Err(StorageError::RowShape {
                expected: public,
                got: values.len(),
            }
            .into());
        }
        txn.set(&self.record_key(handle, None), Vec::new())?;
        let mut values = values.iter();
        for col in self.info.writable_columns() {
            let value = if col.state.is_readable() {
                values.next().unwrap_or(&Datum::Null)
            } else {
                &col.default_value
            };
            self.set_col_value(txn, &self.record_key(handle, Some(col)), value)?;
        }
        Ok(())
    }

    /// Delete a row and every cell a delete must clean up.
    pub fn remove_record(&self, txn: &mut dyn Transaction, handle: i64) -> FalconResult<()> {
        txn.delete(&self.record_key(handle, None))?;
        for col in self.info.deletable_columns() {
            txn.delete(&self.record_key(handle, Some(col)))?;
        }
        Ok(())
    }

    /// Project a row onto the public columns. Cells that were never written
    /// read as the column's default.
    pub fn row(&self, txn: &mut dyn Transaction, handle: i64) -> FalconResult<Option<Vec<Datum>>> {
        if !self.row_exists(txn, handle)? {
            return Ok(None);
        }
        let mut out = Vec::new();
        for col in self.info.public_columns() {
            let value = self.col_value(txn, handle, col)?;
            out.push(value.unwrap_or_else(|| col.default_value.clone()));
        }
        Ok(Some(out))
    }
}
