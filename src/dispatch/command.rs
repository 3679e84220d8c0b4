use std::collections::HashMap;

use chrono::Utc;

use crate::dispatch::Dispatcher;
use crate::event::{InboundEvent, Reply};

pub const UNKNOWN_USER: &str = "Unknown user";
pub const UNKNOWN_NAME: &str = "<name unknown>";
const TRACKING_FAILED: &str = "Could not update karma tracking, try again later";

/// Chat commands. Everything but opt-in/opt-out is rate limited per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Karma,
    TotalKarma,
    OptIn,
    OptOut,
    OptStatus,
    Uptime,
}

impl Command {
    pub const ALL: [Command; 6] = [
        Command::Karma,
        Command::TotalKarma,
        Command::OptIn,
        Command::OptOut,
        Command::OptStatus,
        Command::Uptime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Karma => "karma",
            Command::TotalKarma => "tkarma",
            Command::OptIn => "optin",
            Command::OptOut => "optout",
            Command::OptStatus => "optstatus",
            Command::Uptime => "uptime",
        }
    }

    pub fn needs_timer(self) -> bool {
        !matches!(self, Command::OptIn | Command::OptOut)
    }

    pub fn registry() -> HashMap<&'static str, Command> {
        Self::ALL.iter().map(|c| (c.name(), *c)).collect()
    }

    /// Run the command; true when a reply reached the room.
    pub(crate) async fn execute(self, d: &Dispatcher, args: &str, evt: &InboundEvent) -> bool {
        let reply = match self {
            Command::Karma | Command::TotalKarma => {
                let target = d.resolve_target(args, evt).await;
                let room = (self == Command::Karma).then(|| evt.room_id.clone());
                let user = target.user_id.clone();
                let balance = d
                    .with_engine("karma.balance", move |e| e.balance(&user, room.as_deref()))
                    .await;
                match balance {
                    Ok(Some(n)) => {
                        let lead = if self == Command::Karma { "Current karma" } else { "Total karma" };
                        Reply::rich(
                            &evt.room_id,
                            format!("{lead} for {}: {n}", target.label),
                            format!("{lead} for {}: {n}", pill(&target.user_id, &target.label)),
                        )
                    }
                    Ok(None) | Err(_) => Reply::text(&evt.room_id, UNKNOWN_USER),
                }
            }
            Command::OptStatus => {
                let target = d.resolve_target(args, evt).await;
                let user = target.user_id.clone();
                match d.with_engine("karma.opt_status", move |e| e.is_opted_out(&user)).await {
                    Ok(opted_out) => {
                        let verdict = if opted_out {
                            "is not allowed to be tracked in the karma system"
                        } else {
                            "can be tracked in the karma system"
                        };
                        Reply::rich(
                            &evt.room_id,
                            format!("{} {verdict}", target.label),
                            format!("{} {verdict}", pill(&target.user_id, &target.label)),
                        )
                    }
                    Err(_) => Reply::text(&evt.room_id, UNKNOWN_USER),
                }
            }
            Command::OptIn | Command::OptOut => {
                let label = d.sender_label(evt).await;
                let user = evt.sender.clone();
                let opting_out = self == Command::OptOut;
                let result = d
                    .with_engine("karma.opt", move |e| {
                        if opting_out {
                            e.opt_out(&user)
                        } else {
                            e.opt_in(&user)
                        }
                    })
                    .await;
                match result {
                    Ok(()) if opting_out => Reply::text(
                        &evt.room_id,
                        format!("{label} has opted out of karma tracking; their karma history was removed"),
                    ),
                    Ok(()) => Reply::text(&evt.room_id, format!("{label} has opted in to karma tracking")),
                    Err(_) => Reply::text(&evt.room_id, TRACKING_FAILED),
                }
            }
            Command::Uptime => {
                let started = d.started_at();
                let secs = (Utc::now() - started).num_seconds().max(0);
                Reply::text(
                    &evt.room_id,
                    format!(
                        "Up since {}, running for {}d {}h {}m {}s",
                        started.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        secs / 86_400,
                        (secs % 86_400) / 3_600,
                        (secs % 3_600) / 60,
                        secs % 60
                    ),
                )
            }
        };
        d.send(reply).await
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn pill(user_id: &str, label: &str) -> String {
    format!(
        r#"<a href="https://matrix.to/#/{}">{}</a>"#,
        escape_html(user_id),
        escape_html(label)
    )
}
