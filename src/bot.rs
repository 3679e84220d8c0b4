//! Process-level coordinator: opens both stores, owns the engine, runs the
//! event loop and closes everything on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::{CommandOutcome, Dispatched, Dispatcher};
use crate::event::InboundEvent;
use crate::karma::pseudonym::Pseudonymizer;
use crate::karma::KarmaEngine;
use crate::logging::{log, obj, v_int, v_str, Domain, Level};
use crate::store::kv::KeyValueStore;
use crate::store::ledger::LedgerStore;
use crate::store::session::SessionState;
use crate::store::version::SchemaVersion;
use crate::store::{open_kv, open_ledger};
use crate::transport::ChatClient;

/// Upper bound on waiting for in-flight commands once the loop stops.
const COMMAND_DRAIN: Duration = Duration::from_secs(10);

pub struct KarmaBot {
    cfg: Config,
    kv: Arc<dyn KeyValueStore>,
    ledger: Arc<dyn LedgerStore>,
    engine: Arc<KarmaEngine>,
    started_at: DateTime<Utc>,
}

impl KarmaBot {
    /// Open and migrate both stores. Fails without serving if either migration fails.
    pub fn open(cfg: Config) -> Result<Self> {
        let started_at = Utc::now();
        let markers = cfg.markers()?;
        let kv = open_kv(&cfg).with_context(|| format!("opening {} key-value store", cfg.kv_driver.as_str()))?;

        let hash_key = match &cfg.hash_key {
            Some(key) => Ok(key.clone()),
            None => SessionState::new(Arc::clone(&kv))
                .load_or_create_hash_key(|| Pseudonymizer::generate_key().to_vec()),
        };
        let pseudonyms = hash_key
            .map_err(anyhow::Error::from)
            .and_then(|key| Pseudonymizer::new(&key).map_err(anyhow::Error::from));
        let ledger = pseudonyms.and_then(|p| {
            open_ledger(&cfg, p)
                .with_context(|| format!("opening {} ledger at {}", cfg.ledger_driver.as_str(), cfg.ledger_dsn))
        });
        let ledger = match ledger {
            Ok(ledger) => ledger,
            Err(err) => {
                let _ = kv.close();
                return Err(err);
            }
        };

        log(
            Level::Info,
            Domain::System,
            "bot.open",
            obj(&[
                ("kv_driver", v_str(kv.driver())),
                ("kv_version", v_str(&kv.schema_version().to_string())),
                ("ledger_version", v_str(&ledger.schema_version().to_string())),
            ]),
        );

        let engine = Arc::new(KarmaEngine::new(Arc::clone(&ledger), markers));
        Ok(Self {
            cfg,
            kv,
            ledger,
            engine,
            started_at,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn engine(&self) -> Arc<KarmaEngine> {
        Arc::clone(&self.engine)
    }

    pub fn session(&self) -> SessionState {
        SessionState::new(Arc::clone(&self.kv))
    }

    /// (ledger, key-value) schema versions.
    pub fn versions(&self) -> (SchemaVersion, SchemaVersion) {
        (self.ledger.schema_version(), self.kv.schema_version())
    }

    pub fn dispatcher(&self, client: Arc<dyn ChatClient>) -> Result<Arc<Dispatcher>> {
        let d = Dispatcher::new(&self.cfg, self.engine(), client, self.started_at)
            .context("compiling dispatcher patterns")?;
        Ok(Arc::new(d))
    }

    /// Dispatch events until the stream ends or `shutdown` flips to true,
    /// then wait (bounded) for command tasks still in flight so they finish
    /// against open stores. Returns the number of events handed to the
    /// dispatcher.
    pub async fn run(
        &self,
        dispatcher: Arc<Dispatcher>,
        mut events: mpsc::Receiver<InboundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let mut handled = 0u64;
        let mut in_flight: Vec<JoinHandle<CommandOutcome>> = Vec::new();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = events.recv() => match next {
                    Some(evt) => {
                        in_flight.retain(|h| !h.is_finished());
                        if let Dispatched::Command(handle) = dispatcher.dispatch(evt).await {
                            in_flight.push(handle);
                        }
                        handled += 1;
                    }
                    None => break,
                },
            }
        }
        log(
            Level::Info,
            Domain::System,
            "bot.loop_stopped",
            obj(&[("handled", v_int(handled as i64))]),
        );
        drain_commands(in_flight).await;
        handled
    }

    /// Close the ledger, then the key-value store. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let ledger = self.ledger.close().context("closing ledger");
        let kv = self.kv.close().context("closing key-value store");
        log(Level::Info, Domain::System, "bot.closed", obj(&[]));
        ledger.and(kv)
    }
}

/// Await command tasks up to `COMMAND_DRAIN`. Tasks still running after that
/// are left detached, not cancelled.
async fn drain_commands(mut in_flight: Vec<JoinHandle<CommandOutcome>>) {
    in_flight.retain(|h| !h.is_finished());
    if in_flight.is_empty() {
        return;
    }
    let pending = in_flight.len();
    let drained = tokio::time::timeout(COMMAND_DRAIN, async {
        for handle in in_flight.iter_mut() {
            let _ = handle.await;
        }
    })
    .await;
    let left = in_flight.iter().filter(|h| !h.is_finished()).count();
    log(
        if drained.is_ok() { Level::Info } else { Level::Warn },
        Domain::System,
        "bot.commands_drained",
        obj(&[("pending", v_int(pending as i64)), ("left_running", v_int(left as i64))]),
    );
}
