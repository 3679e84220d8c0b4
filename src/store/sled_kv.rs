//! Key-value driver backed by an embedded sled database.
//!
//! Caller keys live in the default tree; the schema version and other store
//! metadata live in a separate `meta` tree so no caller key can shadow them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sled::transaction::{TransactionError, TransactionResult};

use crate::error::StoreError;
use crate::logging::{log, obj, v_str, ts_now, Domain, Level};
use crate::retry::{retry_sync, RetryConfig};
use crate::store::kv::{KeyValueStore, DEFAULT_MAX_VALUE_BYTES};
use crate::store::version::{Patch, SchemaVersion, VersionedStore};

const META_TREE: &str = "meta";
const VERSION_KEY: &[u8] = b"schema_version";
const CREATED_AT_KEY: &[u8] = b"created_at";

pub struct SledKv {
    db: sled::Db,
    meta: sled::Tree,
    retry: RetryConfig,
    max_value_bytes: usize,
    closed: AtomicBool,
}

fn mark_created(meta: &sled::Tree) -> Result<(), StoreError> {
    // Leaves an existing marker alone.
    let _ = meta.compare_and_swap(CREATED_AT_KEY, None as Option<&[u8]>, Some(ts_now().as_bytes()))?;
    Ok(())
}

pub fn patches() -> Vec<Patch<sled::Tree>> {
    vec![Patch {
        version: SchemaVersion::new(1, 0, 0),
        name: "created-at marker",
        apply: mark_created,
    }]
}

impl SledKv {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, RetryConfig::default(), DEFAULT_MAX_VALUE_BYTES)
    }

    pub fn open_with(path: &Path, retry: RetryConfig, max_value_bytes: usize) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let meta = db.open_tree(META_TREE)?;
        let store = Self {
            db,
            meta,
            retry,
            max_value_bytes,
            closed: AtomicBool::new(false),
        };
        store.upgrade(&patches())?;
        log(
            Level::Info,
            Domain::Store,
            "kv.open",
            obj(&[("driver", v_str("sled")), ("path", v_str(&path.display().to_string()))]),
        );
        Ok(store)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn write_once(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if value.len() > self.max_value_bytes {
            return Err(StoreError::TooLarge {
                len: value.len(),
                max: self.max_value_bytes,
            });
        }
        let outcome: TransactionResult<(), ()> = self.db.transaction(|tx| {
            tx.insert(key, value)?;
            Ok(())
        });
        outcome.map_err(|err| match err {
            TransactionError::Storage(e) => StoreError::Sled(e),
            TransactionError::Abort(()) => StoreError::Conflict("sled transaction aborted".into()),
        })
    }
}

impl VersionedStore for SledKv {
    type Handle = sled::Tree;

    fn current_version(&self) -> SchemaVersion {
        match self.meta.get(VERSION_KEY) {
            Ok(Some(raw)) => SchemaVersion::from_bytes(&raw).unwrap_or(SchemaVersion::ZERO),
            _ => SchemaVersion::ZERO,
        }
    }

    // sled has no multi-statement DDL; patches are idempotent, so a crash
    // between the patch and the version write only replays the patch.
    fn apply_patch(&self, patch: &Patch<sled::Tree>) -> Result<(), StoreError> {
        (patch.apply)(&self.meta)?;
        self.meta.insert(VERSION_KEY, &patch.version.to_bytes()[..])?;
        self.db.flush()?;
        Ok(())
    }
}

impl KeyValueStore for SledKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        retry_sync(&self.retry, "kv.set", || self.write_once(key, value), StoreError::is_transient)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.db.remove(key)?;
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush()?;
        log(Level::Info, Domain::Store, "kv.close", obj(&[("driver", v_str("sled"))]));
        Ok(())
    }

    fn schema_version(&self) -> SchemaVersion {
        self.current_version()
    }

    fn driver(&self) -> &'static str {
        "sled"
    }
}
