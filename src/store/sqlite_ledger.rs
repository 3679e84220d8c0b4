//! SQLite implementation of the karma ledger.

use std::sync::{Mutex, PoisonError};

use rusqlite::{ffi, params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::StoreError;
use crate::karma::pseudonym::Pseudonymizer;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::store::ledger::{KarmaEvent, LedgerStore, Recorded};
use crate::store::sqlite::{self, open_connection, VERSION_DDL};
use crate::store::version::{Patch, SchemaVersion, VersionedStore};

fn create_ledger(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(VERSION_DDL)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            senderID TEXT NOT NULL,
            targetID TEXT NOT NULL,
            eventID  TEXT NOT NULL,
            roomID   TEXT NOT NULL,
            vote     INTEGER NOT NULL,
            PRIMARY KEY (eventID, roomID)
        );
        CREATE TABLE IF NOT EXISTS optout (
            uidHash TEXT PRIMARY KEY
        );",
    )?;
    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS events_target_room ON events (targetID, roomID);
         CREATE INDEX IF NOT EXISTS events_sender ON events (senderID);",
    )?;
    Ok(())
}

/// Ledger migrations, oldest first.
pub fn patches() -> Vec<Patch<Connection>> {
    vec![
        Patch {
            version: SchemaVersion::new(1, 0, 0),
            name: "karma ledger",
            apply: create_ledger,
        },
        Patch {
            version: SchemaVersion::new(1, 1, 0),
            name: "ledger indexes",
            apply: create_indexes,
        },
    ]
}

fn is_duplicate_key(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub struct SqliteLedger {
    conn: Mutex<Option<Connection>>,
    pseudonyms: Pseudonymizer,
}

impl SqliteLedger {
    pub fn open(dsn: &str, pseudonyms: Pseudonymizer) -> Result<Self, StoreError> {
        Self::open_with_patches(dsn, pseudonyms, &patches())
    }

    /// Open and bring the schema up to the newest of `patches`.
    /// A migration failure is returned and the ledger is not handed out.
    pub fn open_with_patches(
        dsn: &str,
        pseudonyms: Pseudonymizer,
        patches: &[Patch<Connection>],
    ) -> Result<Self, StoreError> {
        let conn = open_connection(dsn)?;
        let ledger = Self {
            conn: Mutex::new(Some(conn)),
            pseudonyms,
        };
        let version = ledger.upgrade(patches)?;
        log(
            Level::Info,
            Domain::Store,
            "ledger.open",
            obj(&[("dsn", v_str(dsn)), ("version", v_str(&version.to_string()))]),
        );
        Ok(ledger)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }
}

impl VersionedStore for SqliteLedger {
    type Handle = Connection;

    fn current_version(&self) -> SchemaVersion {
        self.with_conn(|conn| Ok(sqlite::read_version(conn)))
            .unwrap_or(SchemaVersion::ZERO)
    }

    fn apply_patch(&self, patch: &Patch<Connection>) -> Result<(), StoreError> {
        self.with_conn(|conn| sqlite::apply_patch(conn, patch))
    }
}

impl LedgerStore for SqliteLedger {
    fn record_event(&self, event: &KarmaEvent) -> Result<Recorded, StoreError> {
        let sender_hash = self.pseudonyms.pseudonym(&event.sender_id);
        let target_hash = self.pseudonyms.pseudonym(&event.target_id);
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO events (senderID, targetID, eventID, roomID, vote)
                 SELECT ?1, ?2, ?3, ?4, ?5
                 WHERE NOT EXISTS (SELECT 1 FROM optout WHERE uidHash IN (?6, ?7))",
                params![
                    event.sender_id,
                    event.target_id,
                    event.event_id,
                    event.room_id,
                    event.vote,
                    sender_hash,
                    target_hash
                ],
            );
            match inserted {
                Ok(0) => Ok(Recorded::OptedOut),
                Ok(_) => Ok(Recorded::Inserted),
                Err(err) if is_duplicate_key(&err) => Ok(Recorded::AlreadyPresent),
                Err(err) => Err(err.into()),
            }
        })
    }

    fn delete_event(&self, event_id: &str, room_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM events WHERE eventID = ?1 AND roomID = ?2",
                params![event_id, room_id],
            )?;
            Ok(removed > 0)
        })
    }

    fn get_event(&self, event_id: &str, room_id: &str) -> Result<Option<KarmaEvent>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT senderID, targetID, eventID, roomID, vote FROM events
                     WHERE eventID = ?1 AND roomID = ?2",
                    params![event_id, room_id],
                    |r| {
                        Ok(KarmaEvent {
                            sender_id: r.get(0)?,
                            target_id: r.get(1)?,
                            event_id: r.get(2)?,
                            room_id: r.get(3)?,
                            vote: r.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    fn balance(&self, target_id: &str, room_id: Option<&str>) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(vote), 0) FROM events
                 WHERE targetID = ?1 AND (?2 IS NULL OR roomID = ?2)",
                params![target_id, room_id],
                |r| r.get(0),
            )?;
            Ok(total)
        })
    }

    fn is_opted_out(&self, user_id: &str) -> Result<bool, StoreError> {
        let hash = self.pseudonyms.pseudonym(user_id);
        self.with_conn(|conn| {
            let present: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM optout WHERE uidHash = ?1)",
                params![hash],
                |r| r.get(0),
            )?;
            Ok(present)
        })
    }

    fn set_opt_out(&self, user_id: &str) -> Result<(), StoreError> {
        let hash = self.pseudonyms.pseudonym(user_id);
        let purged = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("INSERT OR IGNORE INTO optout (uidHash) VALUES (?1)", params![hash])?;
            let purged = tx.execute(
                "DELETE FROM events WHERE senderID = ?1 OR targetID = ?1",
                params![user_id],
            )?;
            tx.commit()?;
            Ok(purged)
        })?;
        log(
            Level::Info,
            Domain::Store,
            "ledger.opt_out",
            obj(&[("purged", v_int(purged as i64))]),
        );
        Ok(())
    }

    fn clear_opt_out(&self, user_id: &str) -> Result<(), StoreError> {
        let hash = self.pseudonyms.pseudonym(user_id);
        self.with_conn(|conn| {
            conn.execute("DELETE FROM optout WHERE uidHash = ?1", params![hash])?;
            Ok(())
        })
    }

    fn schema_version(&self) -> SchemaVersion {
        self.current_version()
    }

    fn close(&self) -> Result<(), StoreError> {
        let taken = self.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, err)| StoreError::Sqlite(err))?;
            log(Level::Info, Domain::Store, "ledger.close", obj(&[]));
        }
        Ok(())
    }
}
