//! Durable message storage.
//!
//! One sqlite table holds every message the gateway has ever handled;
//! rows in NEW or PENDING_ACK are reloaded on startup so delivery can
//! resume after a crash. Payloads are stored as JSON text so the column
//! stays readable from CLI tools.

use anyhow::{bail, Context, Result};
use rusqlite::params;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio_rusqlite::Connection;

use crate::message::{Message, MessageKind, MessageState};

type StoredRow = (
    i64,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    i64,
    String,
    String,
);

pub struct Store {
    conn: Connection,
    /// Last issued sequence id, seeded from MAX(sequence_id).
    last_sequence: AtomicI64,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .await
            .context("Failed to open database")?;

        // Initialize schema
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS messages (
                    sequence_id     INTEGER PRIMARY KEY,
                    entered_at      TEXT DEFAULT (datetime('now')),
                    source_session  TEXT NOT NULL,
                    target_session  TEXT NOT NULL,
                    kind            INTEGER NOT NULL,
                    fcm_message_id  TEXT,
                    group_id        TEXT,
                    state           INTEGER NOT NULL,
                    last_update     TEXT DEFAULT (datetime('now')),
                    payload         TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_target_session ON messages (target_session)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_state ON messages (state)",
                [],
            )?;
            Ok(())
        })
        .await
        .context("Failed to initialize database schema")?;

        let last_sequence = conn
            .call(|conn| {
                let max: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(sequence_id), 0) FROM messages",
                    [],
                    |row| row.get(0),
                )?;
                Ok(max)
            })
            .await
            .context("Failed to seed sequence id")?;

        Ok(Self {
            conn,
            last_sequence: AtomicI64::new(last_sequence),
        })
    }

    /// Atomic monotonic counter; the first id after an empty table is 1.
    pub fn next_sequence_id(&self) -> i64 {
        self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_sequence_id(&self) -> i64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    pub async fn save(&self, msg: &Message) -> Result<()> {
        let sequence_id = msg.sequence_id;
        let source = msg.source_session_id.clone();
        let target = msg.target_session_id.clone();
        let kind = msg.kind.code();
        let fcm_message_id = msg.fcm_message_id.clone();
        let group_id = msg.group_id.clone();
        let state = msg.state.code();
        let payload = msg.payload.to_string();

        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages
                     (sequence_id, source_session, target_session, kind, fcm_message_id, group_id, state, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        sequence_id,
                        source,
                        target,
                        kind,
                        fcm_message_id,
                        group_id,
                        state,
                        payload
                    ],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, _)))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("duplicate sequence id {}", msg.sequence_id)
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to save message {}", msg.identifier())
            }),
        }
    }

    pub async fn update_state(&self, sequence_id: i64, state: MessageState) -> Result<()> {
        let code = state.code();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE messages SET state = ?1, last_update = datetime('now')
                     WHERE sequence_id = ?2",
                    params![code, sequence_id],
                )?;
                if changed == 0 {
                    return Err(tokio_rusqlite::Error::Rusqlite(
                        rusqlite::Error::StatementChangedRows(0),
                    ));
                }
                Ok(())
            })
            .await
            .with_context(|| format!("Failed to update state of message seq:{sequence_id}"))?;
        Ok(())
    }

    /// All NEW and PENDING_ACK rows bound for `target_session`, oldest
    /// first.
    pub async fn load_pending(&self, target_session: &str) -> Result<Vec<Message>> {
        let target = target_session.to_string();
        let rows: Vec<StoredRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sequence_id, entered_at, source_session, target_session, kind,
                            fcm_message_id, group_id, state, last_update, payload
                     FROM messages
                     WHERE state IN (?1, ?2) AND target_session = ?3
                     ORDER BY sequence_id ASC",
                )?;
                let rows = stmt.query_map(
                    params![
                        MessageState::New.code(),
                        MessageState::PendingAck.code(),
                        target
                    ],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                            row.get(8)?,
                            row.get(9)?,
                        ))
                    },
                )?;

                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
            .with_context(|| format!("Failed to load pending messages for {target_session}"))?;

        let mut messages = Vec::with_capacity(rows.len());
        for (seq, entered, source, target, kind, fcm_id, group, state, updated, payload) in rows {
            let kind = MessageKind::from_code(kind)
                .with_context(|| format!("Unknown message kind {kind} in row seq:{seq}"))?;
            let state = MessageState::from_code(state)
                .with_context(|| format!("Unknown message state {state} in row seq:{seq}"))?;
            let payload = serde_json::from_str(&payload)
                .with_context(|| format!("Malformed payload in row seq:{seq}"))?;
            messages.push(Message::from_stored(
                seq,
                kind,
                fcm_id.unwrap_or_default(),
                group.unwrap_or_default(),
                source,
                target,
                state,
                payload,
                entered,
                updated,
            ));
        }
        Ok(messages)
    }
}
