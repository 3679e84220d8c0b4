use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::event::Reply;
use crate::transport::ChatClient;

/// In-process client that records replies. Useful for tests and dry runs.
#[derive(Default)]
pub struct MemoryClient {
    replies: Mutex<Vec<Reply>>,
    senders: Mutex<HashMap<(String, String), String>>,
    names: Mutex<HashMap<String, String>>,
    fail_sends: Mutex<u32>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember_event(&self, room_id: &str, event_id: &str, sender: &str) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((room_id.to_string(), event_id.to_string()), sender.to_string());
    }

    pub fn set_display_name(&self, user_id: &str, name: &str) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), name.to_string());
    }

    /// Make the next `n` sends fail.
    pub fn fail_next_sends(&self, n: u32) {
        *self.fail_sends.lock().unwrap_or_else(PoisonError::into_inner) = n;
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.replies.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ChatClient for MemoryClient {
    async fn send_reply(&self, reply: &Reply) -> Result<()> {
        {
            let mut failing = self.fail_sends.lock().unwrap_or_else(PoisonError::into_inner);
            if *failing > 0 {
                *failing -= 1;
                return Err(anyhow!("send failed"));
            }
        }
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reply.clone());
        Ok(())
    }

    async fn event_sender(&self, room_id: &str, event_id: &str) -> Result<String> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(room_id.to_string(), event_id.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("unknown event {event_id} in {room_id}"))
    }

    async fn display_name(&self, user_id: &str) -> Result<String> {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow!("no display name for {user_id}"))
    }
}
