//! Turns inbound chat events into karma mutations and replies.
//!
//! Each event passes through exactly once:
//! 1. malformed events and the bot's own events are dropped
//! 2. reactions and redactions go straight to the karma engine, unthrottled
//! 3. `<sigil><name> [args]` messages naming a known command run as their own task
//! 4. any other message is offered to the passive handlers in order
//!
//! Rate-limited handlers only consume the room's window when they report
//! that they acted.

pub mod command;
pub mod limiter;
pub mod passive;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::StoreError;
use crate::event::{EventKind, InboundEvent, Reply};
use crate::karma::phrase::{MentionParser, ThanksMatcher, UserRef};
use crate::karma::{KarmaEngine, KarmaOutcome};
use crate::logging::{log, log_dropped, log_store_error, obj, v_str, Domain, Level};
use crate::retry::{retry_async, RetryConfig};
use crate::transport::ChatClient;

use command::{Command, UNKNOWN_NAME};
use limiter::RateLimiter;
use passive::PassiveHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    RateLimited,
    Acted,
    NoEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Karma(KarmaOutcome),
    /// The reacted-to event's author could not be resolved.
    UnknownTarget,
    Failed,
}

#[derive(Debug)]
pub enum Dispatched {
    Dropped(&'static str),
    /// Command running on its own task; await the handle to observe completion.
    Command(JoinHandle<CommandOutcome>),
    FreeText { fired: usize },
    Reaction(ReactionOutcome),
    Redaction { removed: bool },
}

pub struct Dispatcher {
    bot_user: String,
    command_re: Regex,
    commands: HashMap<&'static str, Command>,
    passive: Vec<PassiveHandler>,
    mentions: MentionParser,
    limiter: RateLimiter,
    engine: Arc<KarmaEngine>,
    client: Arc<dyn ChatClient>,
    started_at: DateTime<Utc>,
    reply_retry: RetryConfig,
}

fn event_time_us(evt: &InboundEvent) -> i64 {
    evt.origin_ts_us
        .unwrap_or_else(|| Utc::now().timestamp_micros())
}

impl Dispatcher {
    pub fn new(
        cfg: &Config,
        engine: Arc<KarmaEngine>,
        client: Arc<dyn ChatClient>,
        started_at: DateTime<Utc>,
    ) -> Result<Self, regex::Error> {
        let sigil = regex::escape(&cfg.sigil.to_string());
        let command_re = Regex::new(&format!(
            r"(?s)^{sigil}(?P<name>[A-Za-z]+)(?:\s+(?P<args>.*))?$"
        ))?;
        Ok(Self {
            bot_user: cfg.username.clone(),
            command_re,
            commands: Command::registry(),
            passive: vec![PassiveHandler::ThankYou(ThanksMatcher::new()?)],
            mentions: MentionParser::new()?,
            limiter: RateLimiter::new(cfg.response_freq_us),
            engine,
            client,
            started_at,
            reply_retry: RetryConfig::default(),
        })
    }

    pub fn with_reply_retry(mut self, retry: RetryConfig) -> Self {
        self.reply_retry = retry;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Known command and its trimmed arguments, if the body is one.
    pub fn classify(&self, body: &str) -> Option<(Command, String)> {
        let caps = self.command_re.captures(body.trim_end())?;
        let name = caps.name("name")?.as_str().to_lowercase();
        let command = *self.commands.get(name.as_str())?;
        let args = caps
            .name("args")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        Some((command, args))
    }

    pub async fn dispatch(self: &Arc<Self>, evt: InboundEvent) -> Dispatched {
        if let Some(reason) = evt.malformed() {
            log_dropped(&evt.room_id, &evt.event_id, reason);
            return Dispatched::Dropped(reason);
        }
        if evt.sender == self.bot_user {
            log_dropped(&evt.room_id, &evt.event_id, "own message");
            return Dispatched::Dropped("own message");
        }

        match evt.kind {
            EventKind::Reaction => Dispatched::Reaction(self.on_reaction(&evt).await),
            EventKind::Redaction => Dispatched::Redaction {
                removed: self.on_redaction(&evt).await,
            },
            EventKind::Message => match self.classify(&evt.body) {
                Some((command, args)) => {
                    let this = Arc::clone(self);
                    Dispatched::Command(tokio::spawn(async move {
                        this.run_command(command, &args, &evt).await
                    }))
                }
                None => Dispatched::FreeText {
                    fired: self.run_passive(&evt).await,
                },
            },
        }
    }

    async fn run_command(&self, command: Command, args: &str, evt: &InboundEvent) -> CommandOutcome {
        let now = event_time_us(evt);
        if command.needs_timer() && !self.limiter.ready(&evt.room_id, now) {
            log(
                Level::Debug,
                Domain::Dispatch,
                "dispatch.rate_limited",
                obj(&[
                    ("room_id", v_str(&evt.room_id)),
                    ("event_id", v_str(&evt.event_id)),
                    ("command", v_str(command.name())),
                ]),
            );
            return CommandOutcome::RateLimited;
        }

        let acted = command.execute(self, args, evt).await;
        if acted && command.needs_timer() {
            self.limiter.mark(&evt.room_id, now);
        }
        log(
            Level::Info,
            Domain::Dispatch,
            "dispatch.command",
            obj(&[
                ("room_id", v_str(&evt.room_id)),
                ("event_id", v_str(&evt.event_id)),
                ("command", v_str(command.name())),
                ("acted", serde_json::Value::Bool(acted)),
            ]),
        );
        if acted {
            CommandOutcome::Acted
        } else {
            CommandOutcome::NoEffect
        }
    }

    async fn run_passive(&self, evt: &InboundEvent) -> usize {
        let now = event_time_us(evt);
        let mut fired = 0;
        for handler in &self.passive {
            if !handler.fast_match(evt) {
                continue;
            }
            if handler.needs_timer() && !self.limiter.ready(&evt.room_id, now) {
                continue;
            }
            if handler.process(self, evt).await {
                fired += 1;
                if handler.needs_timer() {
                    self.limiter.mark(&evt.room_id, now);
                }
                log(
                    Level::Debug,
                    Domain::Dispatch,
                    "dispatch.passive",
                    obj(&[
                        ("room_id", v_str(&evt.room_id)),
                        ("event_id", v_str(&evt.event_id)),
                        ("handler", v_str(handler.name())),
                    ]),
                );
            }
        }
        fired
    }

    async fn on_reaction(&self, evt: &InboundEvent) -> ReactionOutcome {
        let (Some(target_event), Some(key)) = (evt.relates_to.as_deref(), evt.annotation_key.as_deref()) else {
            return ReactionOutcome::Karma(KarmaOutcome::NoMatch);
        };
        let Some(vote) = self.engine.classify(key) else {
            return ReactionOutcome::Karma(KarmaOutcome::NoMatch);
        };
        let target = match self.client.event_sender(&evt.room_id, target_event).await {
            Ok(target) => target,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Dispatch,
                    "dispatch.reaction_target_unknown",
                    obj(&[
                        ("room_id", v_str(&evt.room_id)),
                        ("event_id", v_str(&evt.event_id)),
                        ("error", v_str(&err.to_string())),
                    ]),
                );
                return ReactionOutcome::UnknownTarget;
            }
        };

        let sender = evt.sender.clone();
        let event_id = evt.event_id.clone();
        let room = evt.room_id.clone();
        match self
            .with_engine("karma.reaction", move |e| e.record_vote(&sender, &target, &event_id, &room, vote))
            .await
        {
            Ok(outcome) => ReactionOutcome::Karma(outcome),
            Err(_) => ReactionOutcome::Failed,
        }
    }

    async fn on_redaction(&self, evt: &InboundEvent) -> bool {
        let Some(redacts) = evt.redacts.clone() else {
            return false;
        };
        let room = evt.room_id.clone();
        self.with_engine("karma.retract", move |e| e.retract(&redacts, &room))
            .await
            .unwrap_or(false)
    }

    /// Run a store-touching closure off the async workers. Failures are logged here.
    pub(crate) async fn with_engine<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&KarmaEngine) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        let result = match tokio::task::spawn_blocking(move || f(&engine)).await {
            Ok(result) => result,
            Err(join_err) => Err(StoreError::Worker(join_err.to_string())),
        };
        if let Err(err) = &result {
            log_store_error(op, err);
        }
        result
    }

    /// Explicit reference in the command, otherwise the sender.
    pub(crate) async fn resolve_target(&self, args: &str, evt: &InboundEvent) -> UserRef {
        if let Some(found) = self.mentions.find(args, evt.formatted_body.as_deref()) {
            return found;
        }
        UserRef {
            user_id: evt.sender.clone(),
            label: self.sender_label(evt).await,
        }
    }

    pub(crate) async fn sender_label(&self, evt: &InboundEvent) -> String {
        match self.client.display_name(&evt.sender).await {
            Ok(name) if !name.trim().is_empty() => name,
            _ => UNKNOWN_NAME.to_string(),
        }
    }

    pub(crate) async fn send(&self, reply: Reply) -> bool {
        let sent = retry_async(
            &self.reply_retry,
            "send_reply",
            || self.client.send_reply(&reply),
            |_| true,
        )
        .await;
        match sent {
            Ok(()) => true,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Transport,
                    "reply.failed",
                    obj(&[("room_id", v_str(&reply.room_id)), ("error", v_str(&err.to_string()))]),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::karma::markers::ReactionMarkers;
    use crate::karma::pseudonym::Pseudonymizer;
    use crate::store::sqlite::MEMORY_DSN;
    use crate::store::sqlite_ledger::SqliteLedger;
    use crate::transport::memory::MemoryClient;

    const BOT: &str = "@karma:example.org";
    const ROOM: &str = "!room:example.org";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 1,
            jitter_factor: 0.0,
        }
    }

    fn setup(freq_us: i64) -> (Arc<Dispatcher>, Arc<MemoryClient>, Arc<KarmaEngine>) {
        let freq = freq_us.to_string();
        let cfg = Config::from_vars(|k| match k {
            "KARMA_USERNAME" => Some(BOT.to_string()),
            "KARMA_RESPONSE_FREQ" => Some(freq.clone()),
            _ => None,
        })
        .unwrap();
        let ledger = SqliteLedger::open(MEMORY_DSN, Pseudonymizer::new(b"dispatch").unwrap()).unwrap();
        let engine = Arc::new(KarmaEngine::new(Arc::new(ledger), ReactionMarkers::defaults().unwrap()));
        let client = Arc::new(MemoryClient::new());
        let d = Dispatcher::new(&cfg, engine.clone(), client.clone(), Utc::now())
            .unwrap()
            .with_reply_retry(fast_retry());
        (Arc::new(d), client, engine)
    }

    async fn run(d: &Arc<Dispatcher>, evt: InboundEvent) -> Option<CommandOutcome> {
        match d.dispatch(evt).await {
            Dispatched::Command(handle) => Some(handle.await.unwrap()),
            _ => None,
        }
    }

    #[test]
    fn classify_commands() {
        let (d, _, _) = setup(1_000);
        assert_eq!(d.classify("!karma"), Some((Command::Karma, String::new())));
        assert_eq!(
            d.classify("!KARMA  @bob:x "),
            Some((Command::Karma, "@bob:x".to_string()))
        );
        assert_eq!(d.classify("!tkarma\n@bob:x"), Some((Command::TotalKarma, "@bob:x".to_string())));
        assert_eq!(d.classify("!nosuch thing"), None);
        assert_eq!(d.classify("karma"), None);
        assert_eq!(d.classify("say !karma"), None);
    }

    #[tokio::test]
    async fn own_and_malformed_events_are_dropped() {
        let (d, client, _) = setup(1_000);
        let own = InboundEvent::message(BOT, ROOM, "$1", "!karma");
        assert!(matches!(d.dispatch(own).await, Dispatched::Dropped("own message")));
        let mut bad = InboundEvent::message("@a:x", ROOM, "$2", "!karma");
        bad.event_id.clear();
        assert!(matches!(d.dispatch(bad).await, Dispatched::Dropped(_)));
        assert!(client.replies().is_empty());
    }

    #[tokio::test]
    async fn karma_command_replies_with_balance() {
        let (d, client, engine) = setup(1_000);
        engine
            .record_vote("@a:x", "@bob:x", "$v", ROOM, crate::karma::markers::Vote::Up)
            .unwrap();
        let evt = InboundEvent::message("@a:x", ROOM, "$c", "!karma @bob:x").at(10);
        assert_eq!(run(&d, evt).await, Some(CommandOutcome::Acted));
        let replies = client.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, "Current karma for @bob:x: 1");
        assert!(replies[0].formatted_body.as_deref().unwrap().contains("matrix.to"));
    }

    #[tokio::test]
    async fn sender_is_default_target_and_unknown_name_fallback() {
        let (d, client, _) = setup(1_000);
        run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!karma").at(10)).await;
        client.set_display_name("@b:x", "Bee");
        run(&d, InboundEvent::message("@b:x", "!other:x", "$2", "!karma").at(10)).await;
        let replies = client.replies();
        assert_eq!(replies[0].body, "Current karma for <name unknown>: 0");
        assert_eq!(replies[1].body, "Current karma for Bee: 0");
    }

    #[tokio::test]
    async fn rate_limit_window() {
        let f = 1_000;
        let t = 1_000_000;

        let (d, client, _) = setup(f);
        assert_eq!(run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!karma").at(t)).await, Some(CommandOutcome::Acted));
        assert_eq!(
            run(&d, InboundEvent::message("@a:x", ROOM, "$2", "!karma").at(t + f - 1)).await,
            Some(CommandOutcome::RateLimited)
        );
        assert_eq!(client.replies().len(), 1);

        let (d, client, _) = setup(f);
        run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!karma").at(t)).await;
        assert_eq!(
            run(&d, InboundEvent::message("@a:x", ROOM, "$2", "!karma").at(t + f + 1)).await,
            Some(CommandOutcome::Acted)
        );
        assert_eq!(client.replies().len(), 2);
    }

    #[tokio::test]
    async fn failed_reply_does_not_consume_window() {
        let (d, client, _) = setup(1_000);
        client.fail_next_sends(2);
        assert_eq!(
            run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!uptime").at(10)).await,
            Some(CommandOutcome::NoEffect)
        );
        assert_eq!(d.limiter().last_fired(ROOM), None);
        assert_eq!(
            run(&d, InboundEvent::message("@a:x", ROOM, "$2", "!uptime").at(11)).await,
            Some(CommandOutcome::Acted)
        );
        assert!(client.replies()[0].body.starts_with("Up since "));
    }

    #[tokio::test]
    async fn opt_commands_ignore_the_window() {
        let (d, client, engine) = setup(1_000_000);
        run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!karma").at(10)).await;
        assert_eq!(
            run(&d, InboundEvent::message("@a:x", ROOM, "$2", "!optout").at(11)).await,
            Some(CommandOutcome::Acted)
        );
        assert!(engine.is_opted_out("@a:x").unwrap());
        assert_eq!(
            run(&d, InboundEvent::message("@a:x", ROOM, "$3", "!optstatus").at(12)).await,
            Some(CommandOutcome::RateLimited)
        );
        run(&d, InboundEvent::message("@a:x", ROOM, "$4", "!optin").at(13)).await;
        assert!(!engine.is_opted_out("@a:x").unwrap());
        assert_eq!(client.replies().len(), 3);
    }

    #[tokio::test]
    async fn opted_out_target_reads_as_unknown() {
        let (d, client, engine) = setup(1);
        engine.opt_out("@bob:x").unwrap();
        run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!karma @bob:x").at(10)).await;
        run(&d, InboundEvent::message("@a:x", ROOM, "$2", "!optstatus @bob:x").at(20)).await;
        let replies = client.replies();
        assert_eq!(replies[0].body, "Unknown user");
        assert_eq!(replies[1].body, "@bob:x is not allowed to be tracked in the karma system");
    }

    #[tokio::test]
    async fn thanks_records_upvote_without_reply() {
        let (d, client, engine) = setup(1_000);
        let evt = InboundEvent::message("@a:x", ROOM, "$t", "thanks Bob")
            .with_formatted(r#"thanks <a href="https://matrix.to/#/@bob:x">Bob</a>"#);
        assert!(matches!(d.dispatch(evt).await, Dispatched::FreeText { fired: 1 }));
        assert_eq!(engine.balance("@bob:x", Some(ROOM)).unwrap(), Some(1));

        // plain-text only never fast-matches
        let plain = InboundEvent::message("@a:x", ROOM, "$u", "thanks @bob:x");
        assert!(matches!(d.dispatch(plain).await, Dispatched::FreeText { fired: 0 }));
        assert!(client.replies().is_empty());
    }

    #[tokio::test]
    async fn reactions_bypass_window_and_resolve_target() {
        let (d, client, engine) = setup(1_000_000);
        client.remember_event(ROOM, "$msg", "@bob:x");
        run(&d, InboundEvent::message("@a:x", ROOM, "$1", "!karma").at(10)).await;

        let r = InboundEvent::reaction("@a:x", ROOM, "$r1", "$msg", "👍").at(11);
        assert_eq!(
            match d.dispatch(r).await {
                Dispatched::Reaction(o) => o,
                other => panic!("unexpected {other:?}"),
            },
            ReactionOutcome::Karma(KarmaOutcome::Recorded(crate::karma::markers::Vote::Up))
        );
        let unknown = InboundEvent::reaction("@a:x", ROOM, "$r2", "$gone", "👍");
        assert!(matches!(
            d.dispatch(unknown).await,
            Dispatched::Reaction(ReactionOutcome::UnknownTarget)
        ));
        let other = InboundEvent::reaction("@a:x", ROOM, "$r3", "$msg", "🦀");
        assert!(matches!(
            d.dispatch(other).await,
            Dispatched::Reaction(ReactionOutcome::Karma(KarmaOutcome::NoMatch))
        ));
        assert_eq!(engine.balance("@bob:x", None).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn redaction_retracts_vote() {
        let (d, client, engine) = setup(1_000);
        client.remember_event(ROOM, "$msg", "@bob:x");
        d.dispatch(InboundEvent::reaction("@a:x", ROOM, "$r1", "$msg", "🎉")).await;
        assert_eq!(engine.balance("@bob:x", None).unwrap(), Some(1));
        assert!(matches!(
            d.dispatch(InboundEvent::redaction("@a:x", ROOM, "$red", "$r1")).await,
            Dispatched::Redaction { removed: true }
        ));
        assert_eq!(engine.balance("@bob:x", None).unwrap(), Some(0));
        assert!(matches!(
            d.dispatch(InboundEvent::redaction("@a:x", ROOM, "$red2", "$r1")).await,
            Dispatched::Redaction { removed: false }
        ));
    }
}
