//! Karma policy between the dispatcher and the ledger.
//!
//! The engine owns the rules that are not storage: opt-out suppression for
//! both parties, the self-vote guard, and reaction classification.

pub mod markers;
pub mod phrase;
pub mod pseudonym;

use std::sync::Arc;

use crate::error::StoreError;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::store::ledger::{KarmaEvent, LedgerStore, Recorded};

use markers::{ReactionMarkers, Vote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    OptedOut,
    SelfVote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KarmaOutcome {
    Recorded(Vote),
    /// Same `(event_id, room_id)` was already counted.
    Duplicate,
    Suppressed(SuppressReason),
    /// Annotation is in neither marker set.
    NoMatch,
}

pub struct KarmaEngine {
    ledger: Arc<dyn LedgerStore>,
    markers: ReactionMarkers,
}

impl KarmaEngine {
    pub fn new(ledger: Arc<dyn LedgerStore>, markers: ReactionMarkers) -> Self {
        Self { ledger, markers }
    }

    pub fn classify(&self, annotation: &str) -> Option<Vote> {
        self.markers.classify(annotation)
    }

    pub fn record_vote(
        &self,
        sender: &str,
        target: &str,
        event_id: &str,
        room_id: &str,
        vote: Vote,
    ) -> Result<KarmaOutcome, StoreError> {
        if sender == target {
            return Ok(self.suppressed(event_id, room_id, SuppressReason::SelfVote));
        }

        let event = KarmaEvent {
            sender_id: sender.to_string(),
            target_id: target.to_string(),
            event_id: event_id.to_string(),
            room_id: room_id.to_string(),
            vote: vote.weight(),
        };
        let outcome = match self.ledger.record_event(&event)? {
            Recorded::Inserted => KarmaOutcome::Recorded(vote),
            Recorded::AlreadyPresent => KarmaOutcome::Duplicate,
            Recorded::OptedOut => {
                return Ok(self.suppressed(event_id, room_id, SuppressReason::OptedOut));
            }
        };
        log(
            Level::Debug,
            Domain::Karma,
            "karma.vote",
            obj(&[
                ("room_id", v_str(room_id)),
                ("event_id", v_str(event_id)),
                ("vote", v_int(vote.weight())),
                ("duplicate", serde_json::Value::Bool(outcome == KarmaOutcome::Duplicate)),
            ]),
        );
        Ok(outcome)
    }

    /// Classify `annotation` and record the resulting vote, if any.
    pub fn apply_reaction(
        &self,
        sender: &str,
        target: &str,
        event_id: &str,
        room_id: &str,
        annotation: &str,
    ) -> Result<KarmaOutcome, StoreError> {
        match self.classify(annotation) {
            Some(vote) => self.record_vote(sender, target, event_id, room_id, vote),
            None => Ok(KarmaOutcome::NoMatch),
        }
    }

    /// `None` when the user is opted out, so callers cannot reveal their history.
    pub fn balance(&self, user: &str, room_id: Option<&str>) -> Result<Option<i64>, StoreError> {
        if self.ledger.is_opted_out(user)? {
            return Ok(None);
        }
        Ok(Some(self.ledger.balance(user, room_id)?))
    }

    pub fn is_opted_out(&self, user: &str) -> Result<bool, StoreError> {
        self.ledger.is_opted_out(user)
    }

    pub fn opt_out(&self, user: &str) -> Result<(), StoreError> {
        self.ledger.set_opt_out(user)
    }

    pub fn opt_in(&self, user: &str) -> Result<(), StoreError> {
        self.ledger.clear_opt_out(user)
    }

    /// The vote counted for a chat event, if one is on record.
    pub fn vote_for(&self, event_id: &str, room_id: &str) -> Result<Option<KarmaEvent>, StoreError> {
        self.ledger.get_event(event_id, room_id)
    }

    /// Drop the vote recorded for a retracted chat event.
    pub fn retract(&self, event_id: &str, room_id: &str) -> Result<bool, StoreError> {
        let removed = self.ledger.delete_event(event_id, room_id)?;
        log(
            Level::Debug,
            Domain::Karma,
            "karma.retract",
            obj(&[
                ("room_id", v_str(room_id)),
                ("event_id", v_str(event_id)),
                ("removed", serde_json::Value::Bool(removed)),
            ]),
        );
        Ok(removed)
    }

    fn suppressed(&self, event_id: &str, room_id: &str, reason: SuppressReason) -> KarmaOutcome {
        let reason_str = match reason {
            SuppressReason::OptedOut => "opted_out",
            SuppressReason::SelfVote => "self_vote",
        };
        log(
            Level::Debug,
            Domain::Karma,
            "karma.suppressed",
            obj(&[
                ("room_id", v_str(room_id)),
                ("event_id", v_str(event_id)),
                ("reason", v_str(reason_str)),
            ]),
        );
        KarmaOutcome::Suppressed(reason)
    }
}
