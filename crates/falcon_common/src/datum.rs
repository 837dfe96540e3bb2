use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StorageError;
use crate::types::DataType;

/// A single scalar value as stored in a column cell.
///
/// Equality here is structural (`Null == Null`): this is the storage view of a
/// value, used to compare what was written against what is read back, not the
/// SQL three-valued comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Timestamp(i64), // microseconds since Unix epoch
    Date(i32),      // days since Unix epoch (1970-01-01)
}

impl Datum {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Datum::Null => None,
            Datum::Boolean(_) => Some(DataType::Boolean),
            Datum::Int32(_) => Some(DataType::Int32),
            Datum::Int64(_) => Some(DataType::Int64),
            Datum::Float64(_) => Some(DataType::Float64),
            Datum::Text(_) => Some(DataType::Text),
            Datum::Timestamp(_) => Some(DataType::Timestamp),
            Datum::Date(_) => Some(DataType::Date),
        }
    }

    /// Whether this value may be stored in a column of type `ty`.
    /// `Null` fits every type.
    pub fn fits(&self, ty: &DataType) -> bool {
        match self.data_type() {
            None => true,
            Some(own) => &own == ty,
        }
    }

    /// Encode into the cell value format stored in the key-value layer.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Decode a cell value previously produced by [`Datum::encode`].
    pub fn decode(raw: &[u8]) -> Result<Datum, StorageError> {
        serde_json::from_slice(raw).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => write!(f, "NULL"),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Int32(v) => write!(f, "{}", v),
            Datum::Int64(v) => write!(f, "{}", v),
            Datum::Float64(v) => write!(f, "{}", v),
            Datum::Text(s) => write!(f, "{}", s),
            Datum::Timestamp(us) => write!(f, "{}", us),
            Datum::Date(days) => write!(f, "{}", days),
        }
    }
}
