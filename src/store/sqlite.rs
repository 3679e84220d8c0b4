//! Shared SQLite plumbing: connection setup and the singleton version row.

use std::fs::create_dir_all;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, TransactionBehavior};

use crate::error::StoreError;
use crate::store::version::{Patch, SchemaVersion};

pub const MEMORY_DSN: &str = ":memory:";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Single-row version table. `present` pins the row count to one.
pub const VERSION_DDL: &str = "
CREATE TABLE IF NOT EXISTS version (
    present INTEGER PRIMARY KEY DEFAULT 1 CHECK (present = 1),
    major   INTEGER NOT NULL,
    minor   INTEGER NOT NULL,
    patch   INTEGER NOT NULL
);";

/// Open a connection, creating parent directories for file-backed databases.
pub fn open_connection(dsn: &str) -> Result<Connection, StoreError> {
    let in_memory = dsn == MEMORY_DSN;
    if !in_memory && !dsn.starts_with("file:") {
        if let Some(parent) = Path::new(dsn).parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent)?;
            }
        }
    }

    let conn = Connection::open(dsn)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    if !in_memory {
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    }
    Ok(conn)
}

/// Version recorded in the store, or zero when the table or row is missing
/// or holds values that do not fit a version triple.
pub fn read_version(conn: &Connection) -> SchemaVersion {
    let row = conn.query_row(
        "SELECT major, minor, patch FROM version WHERE present = 1",
        [],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
    );
    match row {
        Ok((major, minor, patch)) => {
            match (u32::try_from(major), u32::try_from(minor), u32::try_from(patch)) {
                (Ok(major), Ok(minor), Ok(patch)) => SchemaVersion::new(major, minor, patch),
                _ => SchemaVersion::ZERO,
            }
        }
        Err(_) => SchemaVersion::ZERO,
    }
}

/// Run `patch` and stamp its version inside one immediate transaction.
pub fn apply_patch(conn: &mut Connection, patch: &Patch<Connection>) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    (patch.apply)(&tx)?;
    tx.execute_batch(VERSION_DDL)?;
    tx.execute(
        "INSERT INTO version (present, major, minor, patch) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(present) DO UPDATE SET
            major = excluded.major,
            minor = excluded.minor,
            patch = excluded.patch",
        rusqlite::params![
            i64::from(patch.version.major),
            i64::from(patch.version.minor),
            i64::from(patch.version.patch)
        ],
    )?;
    tx.commit()?;
    Ok(())
}
