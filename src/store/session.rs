//! Transport bookkeeping on top of the key-value store.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::store::kv::KeyValueStore;

pub const BATCH_PREFIX: &str = "userid_batch_";
pub const ROOM_PREFIX: &str = "roomid_";
pub const HASH_KEY_KEY: &str = "meta_optout_hash_key";

const RECENT_EVENTS: usize = 512;

/// Cached view of a room: who is in it and who sent recent events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub members: BTreeSet<String>,
    recent: VecDeque<(String, String)>,
}

impl RoomSnapshot {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            ..Self::default()
        }
    }

    /// Remember that `sender` authored `event_id`. Oldest entries fall off past the cap.
    pub fn observe(&mut self, event_id: &str, sender: &str) {
        self.members.insert(sender.to_string());
        if self.sender_of(event_id).is_some() {
            return;
        }
        if self.recent.len() == RECENT_EVENTS {
            self.recent.pop_front();
        }
        self.recent.push_back((event_id.to_string(), sender.to_string()));
    }

    pub fn sender_of(&self, event_id: &str) -> Option<&str> {
        self.recent
            .iter()
            .rev()
            .find(|(id, _)| id == event_id)
            .map(|(_, sender)| sender.as_str())
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }
}

#[derive(Clone)]
pub struct SessionState {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionState {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn get_string(&self, key: String) -> Result<Option<String>, StoreError> {
        Ok(self
            .kv
            .get(key.as_bytes())?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn save_next_batch(&self, user_id: &str, token: &str) -> Result<(), StoreError> {
        self.kv
            .set(format!("{BATCH_PREFIX}{user_id}").as_bytes(), token.as_bytes())
    }

    pub fn load_next_batch(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        self.get_string(format!("{BATCH_PREFIX}{user_id}"))
    }

    pub fn save_room(&self, room: &RoomSnapshot) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(room)?;
        self.kv
            .set(format!("{ROOM_PREFIX}{}", room.room_id).as_bytes(), &raw)
    }

    /// An undecodable snapshot is logged and treated as absent.
    pub fn load_room(&self, room_id: &str) -> Result<Option<RoomSnapshot>, StoreError> {
        let Some(raw) = self.kv.get(format!("{ROOM_PREFIX}{room_id}").as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(room) => Ok(Some(room)),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Store,
                    "session.room_decode_failed",
                    obj(&[("room_id", v_str(room_id)), ("error", v_str(&err.to_string()))]),
                );
                Ok(None)
            }
        }
    }

    /// Return the persisted opt-out hash key, generating and storing one on first use.
    pub fn load_or_create_hash_key(
        &self,
        generate: impl FnOnce() -> Vec<u8>,
    ) -> Result<Vec<u8>, StoreError> {
        if let Some(existing) = self.kv.get(HASH_KEY_KEY.as_bytes())? {
            if !existing.is_empty() {
                return Ok(existing);
            }
        }
        let key = generate();
        self.kv.set(HASH_KEY_KEY.as_bytes(), &key)?;
        log(Level::Info, Domain::Store, "session.hash_key_created", obj(&[]));
        Ok(key)
    }
}
