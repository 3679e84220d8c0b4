//! Key-value driver backed by a single SQLite table.

use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::retry::{retry_sync, RetryConfig};
use crate::store::kv::{KeyValueStore, DEFAULT_MAX_VALUE_BYTES};
use crate::store::sqlite::{self, open_connection};
use crate::store::version::{Patch, SchemaVersion, VersionedStore};

fn create_state_store(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS state_store (
            key BLOB PRIMARY KEY,
            val BLOB NOT NULL
        );",
    )?;
    Ok(())
}

pub fn patches() -> Vec<Patch<Connection>> {
    vec![Patch {
        version: SchemaVersion::new(1, 0, 0),
        name: "state store",
        apply: create_state_store,
    }]
}

pub struct SqliteKv {
    conn: Mutex<Option<Connection>>,
    retry: RetryConfig,
    max_value_bytes: usize,
}

impl SqliteKv {
    pub fn open(dsn: &str) -> Result<Self, StoreError> {
        Self::open_with(dsn, RetryConfig::default(), DEFAULT_MAX_VALUE_BYTES)
    }

    pub fn open_with(dsn: &str, retry: RetryConfig, max_value_bytes: usize) -> Result<Self, StoreError> {
        let conn = open_connection(dsn)?;
        let store = Self {
            conn: Mutex::new(Some(conn)),
            retry,
            max_value_bytes,
        };
        store.upgrade(&patches())?;
        log(
            Level::Info,
            Domain::Store,
            "kv.open",
            obj(&[("driver", v_str("sqlite3")), ("dsn", v_str(dsn))]),
        );
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    fn write_once(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if value.len() > self.max_value_bytes {
            return Err(StoreError::TooLarge {
                len: value.len(),
                max: self.max_value_bytes,
            });
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO state_store (key, val) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET val = excluded.val",
                params![key, value],
            )?;
            Ok(())
        })
    }
}

impl VersionedStore for SqliteKv {
    type Handle = Connection;

    fn current_version(&self) -> SchemaVersion {
        self.with_conn(|conn| Ok(sqlite::read_version(conn)))
            .unwrap_or(SchemaVersion::ZERO)
    }

    fn apply_patch(&self, patch: &Patch<Connection>) -> Result<(), StoreError> {
        self.with_conn(|conn| sqlite::apply_patch(conn, patch))
    }
}

impl KeyValueStore for SqliteKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            let val = conn
                .query_row("SELECT val FROM state_store WHERE key = ?1", params![key], |r| {
                    r.get::<_, Vec<u8>>(0)
                })
                .optional()?;
            Ok(val)
        })
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        retry_sync(&self.retry, "kv.set", || self.write_once(key, value), StoreError::is_transient)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM state_store WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        let taken = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
            log(Level::Info, Domain::Store, "kv.close", obj(&[("driver", v_str("sqlite3"))]));
        }
        Ok(())
    }

    fn schema_version(&self) -> SchemaVersion {
        self.current_version()
    }

    fn driver(&self) -> &'static str {
        "sqlite3"
    }
}
