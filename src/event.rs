//! Typed inbound events and outbound replies exchanged with the chat transport.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Reaction,
    Redaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub sender: String,
    pub room_id: String,
    pub event_id: String,
    pub kind: EventKind,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    /// Reacted-to event, for reactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_key: Option<String>,
    /// Retracted event, for redactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
    /// Origin timestamp in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_ts_us: Option<i64>,
}

impl InboundEvent {
    fn base(kind: EventKind, sender: &str, room_id: &str, event_id: &str) -> Self {
        Self {
            sender: sender.to_string(),
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            kind,
            body: String::new(),
            formatted_body: None,
            relates_to: None,
            annotation_key: None,
            redacts: None,
            origin_ts_us: None,
        }
    }

    pub fn message(sender: &str, room_id: &str, event_id: &str, body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Self::base(EventKind::Message, sender, room_id, event_id)
        }
    }

    pub fn reaction(sender: &str, room_id: &str, event_id: &str, relates_to: &str, key: &str) -> Self {
        Self {
            relates_to: Some(relates_to.to_string()),
            annotation_key: Some(key.to_string()),
            ..Self::base(EventKind::Reaction, sender, room_id, event_id)
        }
    }

    pub fn redaction(sender: &str, room_id: &str, event_id: &str, redacts: &str) -> Self {
        Self {
            redacts: Some(redacts.to_string()),
            ..Self::base(EventKind::Redaction, sender, room_id, event_id)
        }
    }

    pub fn with_formatted(mut self, html: &str) -> Self {
        self.formatted_body = Some(html.to_string());
        self
    }

    pub fn at(mut self, ts_us: i64) -> Self {
        self.origin_ts_us = Some(ts_us);
        self
    }

    /// Reason the event cannot be dispatched, if any.
    pub fn malformed(&self) -> Option<&'static str> {
        let blank = |s: &str| s.trim().is_empty();
        if blank(&self.sender) {
            return Some("missing sender");
        }
        if blank(&self.room_id) {
            return Some("missing room_id");
        }
        if blank(&self.event_id) {
            return Some("missing event_id");
        }
        match self.kind {
            EventKind::Message => None,
            EventKind::Reaction => {
                if self.relates_to.as_deref().map_or(true, blank) {
                    Some("reaction without relates_to")
                } else if self.annotation_key.as_deref().map_or(true, blank) {
                    Some("reaction without annotation_key")
                } else {
                    None
                }
            }
            EventKind::Redaction => {
                if self.redacts.as_deref().map_or(true, blank) {
                    Some("redaction without redacts")
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub room_id: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
}

impl Reply {
    pub fn text(room_id: &str, body: impl Into<String>) -> Self {
        Self {
            room_id: room_id.to_string(),
            body: body.into(),
            formatted_body: None,
        }
    }

    pub fn rich(room_id: &str, body: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            room_id: room_id.to_string(),
            body: body.into(),
            formatted_body: Some(html.into()),
        }
    }
}
