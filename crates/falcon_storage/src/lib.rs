//! Transactional key-value layer used by the online schema-change core.

pub mod codec;
pub mod kv;
pub mod memstore;
pub mod meta;
pub mod mvcc;
pub mod table;

pub use kv::{run_in_new_txn, Snapshot, Storage, Transaction};
pub use memstore::MemStorage;
pub use meta::{Meta, OwnerRecord};
pub use table::Table;
