//! Inspect a karma deployment using the same configuration as the bot.
//!
//! Usage:
//!   karma_admin version
//!   karma_admin balance <user> [room]
//!   karma_admin optstatus <user>
//!   karma_admin event <event_id> <room>

use anyhow::{bail, Context, Result};
use karmabot::bot::KarmaBot;
use karmabot::config::Config;
use serde_json::json;

fn usage() -> &'static str {
    "usage: karma_admin version | balance <user> [room] | optstatus <user> | event <event_id> <room>"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(cmd) = args.first() else {
        bail!(usage());
    };

    let cfg = Config::from_env().context("loading configuration")?;
    let bot = KarmaBot::open(cfg)?;
    let engine = bot.engine();

    let result = match (cmd.as_str(), args.get(1), args.get(2)) {
        ("version", None, None) => {
            let (ledger, kv) = bot.versions();
            Ok(json!({ "ledger": ledger.to_string(), "kv": kv.to_string() }))
        }
        ("balance", Some(user), room) => engine
            .balance(user, room.map(String::as_str))
            .map(|balance| json!({ "user": user, "room": room, "balance": balance }))
            .map_err(anyhow::Error::from),
        ("optstatus", Some(user), None) => engine
            .is_opted_out(user)
            .map(|opted_out| json!({ "user": user, "opted_out": opted_out }))
            .map_err(anyhow::Error::from),
        ("event", Some(event_id), Some(room)) => engine
            .vote_for(event_id, room)
            .map(|vote| json!({ "event_id": event_id, "room": room, "vote": vote }))
            .map_err(anyhow::Error::from),
        _ => Err(anyhow::anyhow!(usage())),
    };

    let closed = bot.close();
    println!("{}", result?);
    closed
}
