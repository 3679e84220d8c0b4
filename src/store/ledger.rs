use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::version::SchemaVersion;

/// One recorded vote. `(event_id, room_id)` is the identity of the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KarmaEvent {
    pub sender_id: String,
    pub target_id: String,
    pub event_id: String,
    pub room_id: String,
    pub vote: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Inserted,
    /// The `(event_id, room_id)` pair was already in the ledger; nothing changed.
    AlreadyPresent,
    /// Sender or target is in the opt-out registry; nothing was written.
    OptedOut,
}

/// Relational karma ledger: event log plus opt-out registry.
///
/// User ids are passed raw; implementations pseudonymize them before they
/// touch the opt-out registry.
pub trait LedgerStore: Send + Sync {
    /// Insert a vote unless either party is opted out. The opt-out check and
    /// the insert are one atomic step, so a concurrent opt-out can never leave
    /// a row behind.
    fn record_event(&self, event: &KarmaEvent) -> Result<Recorded, StoreError>;

    /// Returns whether a row was removed. A missing row is not an error.
    fn delete_event(&self, event_id: &str, room_id: &str) -> Result<bool, StoreError>;

    fn get_event(&self, event_id: &str, room_id: &str) -> Result<Option<KarmaEvent>, StoreError>;

    /// Sum of votes for `target_id`, optionally limited to one room. Zero when nothing matches.
    fn balance(&self, target_id: &str, room_id: Option<&str>) -> Result<i64, StoreError>;

    fn is_opted_out(&self, user_id: &str) -> Result<bool, StoreError>;

    /// Register the opt-out and purge every event the user sent or received, atomically.
    fn set_opt_out(&self, user_id: &str) -> Result<(), StoreError>;

    /// Remove the opt-out. Purged events stay purged.
    fn clear_opt_out(&self, user_id: &str) -> Result<(), StoreError>;

    fn schema_version(&self) -> SchemaVersion;

    fn close(&self) -> Result<(), StoreError>;
}
