use std::sync::Arc;

use anyhow::{Context, Result};
use karmabot::bot::KarmaBot;
use karmabot::config::Config;
use karmabot::logging::{log, obj, v_int, v_str, Domain, Level};
use karmabot::transport::jsonl::JsonLinesClient;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};

const EVENT_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env().context("loading configuration")?;
    log(
        Level::Info,
        Domain::System,
        "bot.start",
        obj(&[
            ("username", v_str(&cfg.username)),
            ("kv_driver", v_str(cfg.kv_driver.as_str())),
            ("ledger_driver", v_str(cfg.ledger_driver.as_str())),
            ("response_freq_us", v_int(cfg.response_freq_us)),
        ]),
    );

    let bot = KarmaBot::open(cfg)?;
    let client = Arc::new(JsonLinesClient::stdout(&bot.config().username, bot.session()));
    let dispatcher = bot.dispatcher(client.clone())?;

    let (tx, rx) = mpsc::channel(EVENT_QUEUE);
    let (stop_tx, stop_rx) = watch::channel(false);

    let reader = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.pump(BufReader::new(tokio::io::stdin()), tx).await })
    };
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log(Level::Info, Domain::System, "bot.signal", obj(&[("signal", v_str("ctrl_c"))]));
            let _ = stop_tx.send(true);
            true
        } else {
            false
        }
    });

    bot.run(dispatcher, rx, stop_rx).await;

    // Loop is stopped; nothing new is admitted before the stores close.
    reader.abort();
    let interrupted = signal.is_finished();
    signal.abort();
    bot.close()?;

    if interrupted {
        // The stdin reader may still be parked in a blocking read.
        std::process::exit(0);
    }
    Ok(())
}
