//! Schema metadata stored in the key-value store.
//!
//! A [`Meta`] session wraps one transaction. Every table update must be
//! preceded by `gen_schema_version` in the same session, so each committed
//! metadata change is tagged with a fresh global schema version.
//!
//! Key layout (raw keys, all under the `m` prefix):
//! - `mSchemaVersion`               → i64 (JSON)
//! - `mDDLOwner`                    → [`OwnerRecord`] (JSON)
//! - `mDB:{schema}:Table:{table}`   → `TableInfo` (JSON)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use falcon_common::error::{FalconResult, MetaError, StorageError};
use falcon_common::schema::TableInfo;
use falcon_common::types::{SchemaId, TableId};

use crate::kv::Transaction;

const SCHEMA_VERSION_KEY: &[u8] = b"mSchemaVersion";
const DDL_OWNER_KEY: &[u8] = b"mDDLOwner";

fn table_key(schema_id: SchemaId, table_id: TableId) -> Vec<u8> {
    format!("mDB:{}:Table:{}", schema_id.0, table_id.0).into_bytes()
}

/// The DDL owner lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub owner_id: String,
    /// Wall-clock expiry in milliseconds; 0 = never expires.
    pub expires_at_ms: u64,
}

impl OwnerRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms != 0 && self.expires_at_ms <= now_ms
    }
}

/// Metadata accessor bound to a single transaction.
pub struct Meta<'a> {
    txn: &'a mut dyn Transaction,
    allocated_version: Option<i64>,
}

impl<'a> Meta<'a> {
    pub fn new(txn: &'a mut dyn Transaction) -> Self {
        Self {
            txn,
            allocated_version: None,
        }
    }

    fn get_json<T: DeserializeOwned>(&mut self, key: &[u8]) -> FalconResult<Option<T>> {
        let raw = match self.txn.get(key) {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            MetaError::Corrupted {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn set_json<T: Serialize>(&mut self, key: &[u8], value: &T) -> FalconResult<()> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.txn.set(key, raw)
    }

    /// Current global schema version (0 before the first change).
    pub fn schema_version(&mut self) -> FalconResult<i64> {
        Ok(self.get_json(SCHEMA_VERSION_KEY)?.unwrap_or(0))
    }

    /// Allocate the next schema version for this session's metadata change.
    pub fn gen_schema_version(&mut self) -> FalconResult<i64> {
        let next = self.schema_version()? + 1;
        self.set_json(SCHEMA_VERSION_KEY, &next)?;
        self.allocated_version = Some(next);
        Ok(next)
    }

    /// Schema version allocated in this session, if any.
    pub fn allocated_version(&self) -> Option<i64> {
        self.allocated_version
    }

    pub fn get_table(
        &mut self,
        schema_id: SchemaId,
        table_id: TableId,
    ) -> FalconResult<Option<TableInfo>> {
        self.get_json(&table_key(schema_id, table_id))
    }

    pub fn create_table(&mut self, schema_id: SchemaId, info: &TableInfo) -> FalconResult<()> {
        let key = table_key(schema_id, info.id);
        if self.get_json::<TableInfo>(&key)?.is_some() {
            return Err(MetaError::TableExists {
                schema_id,
                table_id: info.id,
            }
            .into());
        }
        self.set_json(&key, info)
    }

    /// Persist a changed table definition. Requires a schema version
    /// generated earlier in this session.
    pub fn update_table(&mut self, schema_id: SchemaId, info: &TableInfo) -> FalconResult<()> {
        if self.allocated_version.is_none() {
            return Err(MetaError::SchemaVersionNotAllocated.into());
        }
        let key = table_key(schema_id, info.id);
        if self.get_json::<TableInfo>(&key)?.is_none() {
            return Err(MetaError::TableNotFound {
                schema_id,
                table_id: info.id,
            }
            .into());
        }
        self.set_json(&key, info)
    }

    /// Fail this session's commit if the table definition changes after the
    /// transaction started. Row writers take this to stay on one schema
    /// version per transaction.
    pub fn lock_table(&mut self, schema_id: SchemaId, table_id: TableId) -> FalconResult<()> {
        self.txn.lock_keys(&[table_key(schema_id, table_id).as_slice()])
    }

    pub fn get_ddl_owner(&mut self) -> FalconResult<Option<OwnerRecord>> {
        self.get_json(DDL_OWNER_KEY)
    }

    pub fn set_ddl_owner(&mut self, record: &OwnerRecord) -> FalconResult<()> {
        self.set_json(DDL_OWNER_KEY, record)
    }

    /// Lock the owner record so a concurrent takeover conflicts with this
    /// session's commit.
    pub fn lock_ddl_owner(&mut self) -> FalconResult<()> {
        self.txn.lock_keys(&[DDL_OWNER_KEY])
    }
}
