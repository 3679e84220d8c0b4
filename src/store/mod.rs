//! Storage ports: a key-value store for transport bookkeeping and a
//! relational ledger for karma, each versioned by the same migration engine.

pub mod kv;
pub mod ledger;
pub mod session;
pub mod sled_kv;
pub mod sqlite;
pub mod sqlite_kv;
pub mod sqlite_ledger;
pub mod version;

use std::fs::create_dir_all;
use std::sync::Arc;

use crate::config::{Config, KvDriver, LedgerDriver};
use crate::error::StoreError;
use crate::karma::pseudonym::Pseudonymizer;

use kv::KeyValueStore;
use ledger::LedgerStore;

pub fn open_kv(cfg: &Config) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    let path = cfg.kv_path();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    match cfg.kv_driver {
        KvDriver::Sled => Ok(Arc::new(sled_kv::SledKv::open(&path)?)),
        KvDriver::Sqlite => Ok(Arc::new(sqlite_kv::SqliteKv::open(&path.to_string_lossy())?)),
    }
}

pub fn open_ledger(cfg: &Config, pseudonyms: Pseudonymizer) -> Result<Arc<dyn LedgerStore>, StoreError> {
    match cfg.ledger_driver {
        LedgerDriver::Sqlite => Ok(Arc::new(sqlite_ledger::SqliteLedger::open(&cfg.ledger_dsn, pseudonyms)?)),
    }
}
