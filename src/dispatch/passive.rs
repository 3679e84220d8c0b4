use crate::dispatch::Dispatcher;
use crate::event::InboundEvent;
use crate::karma::markers::Vote;
use crate::karma::phrase::ThanksMatcher;
use crate::karma::KarmaOutcome;

/// Handlers run over every free-text message, in order.
#[derive(Debug, Clone)]
pub enum PassiveHandler {
    /// "thanks @bob" style attribution; records an upvote, never replies.
    ThankYou(ThanksMatcher),
}

impl PassiveHandler {
    pub fn name(&self) -> &'static str {
        match self {
            PassiveHandler::ThankYou(_) => "thank_you",
        }
    }

    pub fn needs_timer(&self) -> bool {
        match self {
            PassiveHandler::ThankYou(_) => false,
        }
    }

    pub fn fast_match(&self, evt: &InboundEvent) -> bool {
        match self {
            PassiveHandler::ThankYou(m) => {
                evt.formatted_body
                    .as_deref()
                    .is_some_and(|html| !html.trim().is_empty())
                    && m.fast_match(&evt.body)
            }
        }
    }

    /// True when the handler changed something.
    pub(crate) async fn process(&self, d: &Dispatcher, evt: &InboundEvent) -> bool {
        match self {
            PassiveHandler::ThankYou(m) => {
                let Some(target) = evt.formatted_body.as_deref().and_then(|html| m.thanked_user(html)) else {
                    return false;
                };
                let sender = evt.sender.clone();
                let event_id = evt.event_id.clone();
                let room = evt.room_id.clone();
                let outcome = d
                    .with_engine("karma.thanks", move |e| {
                        e.record_vote(&sender, &target, &event_id, &room, Vote::Up)
                    })
                    .await;
                matches!(outcome, Ok(KarmaOutcome::Recorded(_)))
            }
        }
    }
}
