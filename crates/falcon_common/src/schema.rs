use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datum::Datum;
use crate::types::{ColumnId, DataType, IndexId, TableId};

/// Phase of a schema object during an online change.
///
/// An added column walks `None → DeleteOnly → WriteOnly → Reorganization →
/// Public`. Each step is committed as a new schema version before the next
/// one starts, so at most two adjacent states are live across the cluster
/// at any moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SchemaState {
    /// Exists only in the DDL job; invisible to every transaction.
    #[default]
    None,
    /// Deletes clean up the object's data; nothing else sees it.
    DeleteOnly,
    /// Writes populate it; reads still ignore it.
    WriteOnly,
    /// Historical rows are being backfilled; writes populate it.
    Reorganization,
    /// Fully visible.
    Public,
}

impl SchemaState {
    /// Readers may project the object.
    pub fn is_readable(self) -> bool {
        self == SchemaState::Public
    }

    /// Inserts and updates must maintain the object.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            SchemaState::WriteOnly | SchemaState::Reorganization | SchemaState::Public
        )
    }

    /// Deletes must remove the object's data.
    pub fn is_deletable(self) -> bool {
        self != SchemaState::None
    }
}

impl fmt::Display for SchemaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaState::None => write!(f, "none"),
            SchemaState::DeleteOnly => write!(f, "delete only"),
            SchemaState::WriteOnly => write!(f, "write only"),
            SchemaState::Reorganization => write!(f, "write reorganization"),
            SchemaState::Public => write!(f, "public"),
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub id: ColumnId,
    pub name: String,
    /// Position used by row codecs and index references.
    pub offset: usize,
    /// Pending logical position; folded into `offset` once backfill is done.
    pub temp_offset: usize,
    pub data_type: DataType,
    pub default_value: Datum,
    pub state: SchemaState,
}

/// A column reference held by an index, by offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    pub offset: usize,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: IndexId,
    pub name: String,
    pub columns: Vec<IndexColumn>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default = "public_state")]
    pub state: SchemaState,
}

fn public_state() -> SchemaState {
    SchemaState::Public
}

/// Table schema snapshot. Column order is the logical column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub indices: Vec<IndexInfo>,
    /// Highest column id ever handed out for this table.
    pub max_column_id: u64,
}

impl TableInfo {
    /// Build a table whose columns are all public, with offsets and ids
    /// following the given order.
    pub fn new(id: TableId, name: &str, columns: Vec<(&str, DataType)>) -> Self {
        let columns: Vec<ColumnInfo> = columns
            .into_iter()
            .enumerate()
            .map(|(i, (name, data_type))| ColumnInfo {
                id: ColumnId(i as u64 + 1),
                name: name.to_string(),
                offset: i,
                temp_offset: i,
                data_type,
                default_value: Datum::Null,
                state: SchemaState::Public,
            })
            .collect();
        let max_column_id = columns.len() as u64;
        Self {
            id,
            name: name.to_string(),
            columns,
            indices: Vec::new(),
            max_column_id,
        }
    }

    /// Find column by name (case-insensitive).
    pub fn find_column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn find_column_mut(&mut self, name: &str) -> Option<&mut ColumnInfo> {
        self.columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Columns visible to readers, in logical order.
    pub fn public_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.state.is_readable())
    }

    /// Columns that inserts must populate.
    pub fn writable_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.state.is_writable())
    }

    /// Columns whose data a delete must remove.
    pub fn deletable_columns(&self) -> impl Iterator<Item = &ColumnInfo> {
        self.columns.iter().filter(|c| c.state.is_deletable())
    }

    /// Add an index over the named columns, resolving their current offsets.
    /// Returns `None` if any column is unknown.
    pub fn with_index(mut self, id: IndexId, name: &str, columns: &[&str]) -> Option<Self> {
        let mut refs = Vec::with_capacity(columns.len());
        for col in columns {
            let c = self.find_column(col)?;
            refs.push(IndexColumn {
                name: c.name.clone(),
                offset: c.offset,
            });
        }
        self.indices.push(IndexInfo {
            id,
            name: name.to_string(),
            columns: refs,
            unique: false,
            state: SchemaState::Public,
        });
        Some(self)
    }
}
