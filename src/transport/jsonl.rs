//! JSON-lines transport: one inbound event per line in, one reply per line out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::event::{InboundEvent, Reply};
use crate::logging::{log, log_store_error, obj, v_int, v_str, Domain, Level};
use crate::store::session::{RoomSnapshot, SessionState};
use crate::transport::{localpart, ChatClient};

type Output = Box<dyn AsyncWrite + Send + Unpin>;

pub struct JsonLinesClient {
    account: String,
    session: SessionState,
    rooms: Arc<Mutex<HashMap<String, RoomSnapshot>>>,
    out: tokio::sync::Mutex<Output>,
}

impl JsonLinesClient {
    pub fn new(account: &str, session: SessionState, out: Output) -> Self {
        Self {
            account: account.to_string(),
            session,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            out: tokio::sync::Mutex::new(out),
        }
    }

    pub fn stdout(account: &str, session: SessionState) -> Self {
        Self::new(account, session, Box::new(tokio::io::stdout()))
    }

    /// Forward events from `reader` until EOF or until the receiver hangs up.
    /// Lines that do not decode are logged and skipped.
    pub async fn pump<R>(&self, reader: R, tx: mpsc::Sender<InboundEvent>) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut line_no: i64 = 0;
        let mut forwarded = 0u64;
        if let Ok(Some(cursor)) = self.session.load_next_batch(&self.account) {
            log(
                Level::Info,
                Domain::Transport,
                "transport.resume",
                obj(&[("cursor", v_str(&cursor))]),
            );
        }
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let evt: InboundEvent = match serde_json::from_str(line) {
                Ok(evt) => evt,
                Err(err) => {
                    log(
                        Level::Warn,
                        Domain::Transport,
                        "transport.malformed",
                        obj(&[("line", v_int(line_no)), ("error", v_str(&err.to_string()))]),
                    );
                    continue;
                }
            };
            self.observe(&evt).await;
            if tx.send(evt).await.is_err() {
                break;
            }
            forwarded += 1;
        }
        log(
            Level::Info,
            Domain::Transport,
            "transport.eof",
            obj(&[("forwarded", v_int(forwarded as i64))]),
        );
        Ok(forwarded)
    }

    /// Record the event's sender in its room snapshot and advance the cursor.
    /// Completes before the event is forwarded, so reactions to it resolve.
    async fn observe(&self, evt: &InboundEvent) {
        let session = self.session.clone();
        let rooms = Arc::clone(&self.rooms);
        let account = self.account.clone();
        let room_id = evt.room_id.clone();
        let event_id = evt.event_id.clone();
        let sender = evt.sender.clone();
        let persisted = tokio::task::spawn_blocking(move || {
            let snapshot = {
                let mut rooms = rooms.lock().unwrap_or_else(PoisonError::into_inner);
                let room = rooms.entry(room_id.clone()).or_insert_with(|| {
                    session
                        .load_room(&room_id)
                        .ok()
                        .flatten()
                        .unwrap_or_else(|| RoomSnapshot::new(&room_id))
                });
                room.observe(&event_id, &sender);
                room.clone()
            };
            if let Err(err) = session.save_room(&snapshot) {
                log_store_error("session.save_room", &err);
            }
            if let Err(err) = session.save_next_batch(&account, &event_id) {
                log_store_error("session.save_next_batch", &err);
            }
        })
        .await;
        if let Err(err) = persisted {
            log_store_error("session.observe", &err);
        }
    }
}

#[async_trait]
impl ChatClient for JsonLinesClient {
    async fn send_reply(&self, reply: &Reply) -> Result<()> {
        let mut line = serde_json::to_vec(reply)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn event_sender(&self, room_id: &str, event_id: &str) -> Result<String> {
        let cached = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .and_then(|room| room.sender_of(event_id).map(str::to_string));
        if let Some(sender) = cached {
            return Ok(sender);
        }
        self.session
            .load_room(room_id)?
            .and_then(|room| room.sender_of(event_id).map(str::to_string))
            .ok_or_else(|| anyhow!("unknown event {event_id} in {room_id}"))
    }

    async fn display_name(&self, user_id: &str) -> Result<String> {
        Ok(localpart(user_id).to_string())
    }
}
