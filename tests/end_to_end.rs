//! Full path from inbound events to ledger and replies, through the bot coordinator.

use std::path::Path;
use std::sync::Arc;

use karmabot::bot::KarmaBot;
use karmabot::config::Config;
use karmabot::dispatch::{CommandOutcome, Dispatched, Dispatcher};
use karmabot::event::InboundEvent;
use karmabot::transport::jsonl::JsonLinesClient;
use karmabot::transport::memory::MemoryClient;
use tokio::sync::{mpsc, watch};

const BOT: &str = "@karma:example.org";
const ROOM: &str = "!general:example.org";
const A: &str = "@alice:example.org";
const B: &str = "@bob:example.org";

fn config(dir: &Path, freq_us: i64) -> Config {
    let dir = dir.to_string_lossy().into_owned();
    let freq = freq_us.to_string();
    Config::from_vars(move |key| match key {
        "KARMA_USERNAME" => Some(BOT.to_string()),
        "KARMA_DB_DIR" => Some(dir.clone()),
        "KARMA_RESPONSE_FREQ" => Some(freq.clone()),
        _ => None,
    })
    .unwrap()
}

async fn command(d: &Arc<Dispatcher>, evt: InboundEvent) -> CommandOutcome {
    match d.dispatch(evt).await {
        Dispatched::Command(handle) => handle.await.unwrap(),
        other => panic!("expected a command, got {other:?}"),
    }
}

#[tokio::test]
async fn reaction_opt_out_opt_in_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let bot = KarmaBot::open(config(dir.path(), 1)).unwrap();
    let client = Arc::new(MemoryClient::new());
    let d = bot.dispatcher(client.clone()).unwrap();
    let engine = bot.engine();

    client.remember_event(ROOM, "$bob-msg", B);

    d.dispatch(InboundEvent::reaction(A, ROOM, "$react-1", "$bob-msg", "👍")).await;
    assert_eq!(engine.balance(B, Some(ROOM)).unwrap(), Some(1));
    assert_eq!(engine.balance(A, Some(ROOM)).unwrap(), Some(0));

    assert_eq!(
        command(&d, InboundEvent::message(A, ROOM, "$opt-out", "!optout")).await,
        CommandOutcome::Acted
    );
    assert_eq!(engine.balance(B, Some(ROOM)).unwrap(), Some(0));

    // reactions while opted out are dropped silently
    d.dispatch(InboundEvent::reaction(A, ROOM, "$react-2", "$bob-msg", "👍")).await;
    assert_eq!(engine.balance(B, Some(ROOM)).unwrap(), Some(0));

    assert_eq!(
        command(&d, InboundEvent::message(A, ROOM, "$opt-in", "!optin")).await,
        CommandOutcome::Acted
    );
    assert_eq!(engine.balance(B, Some(ROOM)).unwrap(), Some(0));

    // same reaction event delivered twice
    d.dispatch(InboundEvent::reaction(A, ROOM, "$react-3", "$bob-msg", "👍")).await;
    d.dispatch(InboundEvent::reaction(A, ROOM, "$react-3", "$bob-msg", "👍")).await;
    assert_eq!(engine.balance(B, Some(ROOM)).unwrap(), Some(1));

    // a distinct reaction event counts again
    d.dispatch(InboundEvent::reaction(A, ROOM, "$react-4", "$bob-msg", "👍")).await;
    assert_eq!(engine.balance(B, Some(ROOM)).unwrap(), Some(2));

    let replies = client.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies[0].body.contains("opted out"));
    assert!(replies[1].body.contains("opted in"));

    bot.close().unwrap();
}

#[tokio::test]
async fn rate_limited_replies_per_room() {
    let f = 5_000_000;
    let t = 1_700_000_000_000_000;
    let dir = tempfile::tempdir().unwrap();
    let bot = KarmaBot::open(config(dir.path(), f)).unwrap();
    let client = Arc::new(MemoryClient::new());
    let d = bot.dispatcher(client.clone()).unwrap();

    command(&d, InboundEvent::message(A, ROOM, "$1", "!karma").at(t)).await;
    command(&d, InboundEvent::message(A, ROOM, "$2", "!tkarma").at(t + f - 1)).await;
    assert_eq!(client.replies().len(), 1);

    command(&d, InboundEvent::message(A, "!other:example.org", "$3", "!karma").at(t + 1)).await;
    assert_eq!(client.replies().len(), 2);

    command(&d, InboundEvent::message(A, ROOM, "$4", "!karma").at(t + f + 1)).await;
    assert_eq!(client.replies().len(), 3);

    bot.close().unwrap();
}

#[tokio::test]
async fn karma_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let bot = KarmaBot::open(config(dir.path(), 1)).unwrap();
        let client = Arc::new(MemoryClient::new());
        let d = bot.dispatcher(client.clone()).unwrap();
        let thanks = InboundEvent::message(A, ROOM, "$thx", "thanks bob").with_formatted(&format!(
            r#"thanks <a href="https://matrix.to/#/{B}">bob</a>"#
        ));
        assert!(matches!(d.dispatch(thanks).await, Dispatched::FreeText { fired: 1 }));
        bot.close().unwrap();
    }
    let bot = KarmaBot::open(config(dir.path(), 1)).unwrap();
    assert_eq!(bot.engine().balance(B, None).unwrap(), Some(1));
    bot.close().unwrap();
}

#[tokio::test]
async fn json_lines_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let bot = KarmaBot::open(config(dir.path(), 1)).unwrap();
    let client = Arc::new(JsonLinesClient::new(BOT, bot.session(), Box::new(tokio::io::sink())));
    let d = bot.dispatcher(client.clone()).unwrap();

    let input = [
        format!(r#"{{"sender":"{B}","room_id":"{ROOM}","event_id":"$m","kind":"message","body":"I fixed it"}}"#),
        "{ broken".to_string(),
        format!(r#"{{"sender":"{A}","room_id":"{ROOM}","event_id":"$r","kind":"reaction","relates_to":"$m","annotation_key":"🎉"}}"#),
        format!(r#"{{"sender":"{BOT}","room_id":"{ROOM}","event_id":"$own","kind":"message","body":"!karma"}}"#),
        format!(r#"{{"sender":"{A}","room_id":"{ROOM}","event_id":"$x","kind":"redaction"}}"#),
    ]
    .join("\n");

    let (tx, rx) = mpsc::channel(16);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let forwarded = client.pump(input.as_bytes(), tx).await.unwrap();
    assert_eq!(forwarded, 4);
    assert_eq!(bot.run(d, rx, stop_rx).await, 4);

    assert_eq!(bot.engine().balance(B, Some(ROOM)).unwrap(), Some(1));
    bot.close().unwrap();
}
