//! The chat-client port and its two implementations.

use anyhow::Result;
use async_trait::async_trait;

use crate::event::Reply;

pub mod jsonl;
pub mod memory;

/// What the dispatcher needs from the chat protocol client.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_reply(&self, reply: &Reply) -> Result<()>;

    /// Author of an earlier event in the room.
    async fn event_sender(&self, room_id: &str, event_id: &str) -> Result<String>;

    async fn display_name(&self, user_id: &str) -> Result<String>;
}

/// Localpart of a `@user:server` id, used when no display name is known.
pub fn localpart(user_id: &str) -> &str {
    let trimmed = user_id.strip_prefix('@').unwrap_or(user_id);
    trimmed.split(':').next().unwrap_or(trimmed)
}
