//! BAL-side TCP plumbing.
//!
//! BAL clients speak length-prefixed JSON: a 4-byte big-endian length
//! followed by one UTF-8 JSON document. The accept loop parks each new
//! connection in the core's unauthenticated table and spawns a reader
//! task; the reader only ever parses frames and pushes events, all state
//! lives with the core.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time a connection gets to present its LOGON frame.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between LOGON success and the pending-message replay.
pub const RESEND_KICK_DELAY: Duration = Duration::from_secs(1);

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// An inbound BAL frame. Unknown fields are ignored; absent ones default
/// so dispatch can decide what is required per message type.
#[derive(Debug, Default, Deserialize)]
pub struct BalFrame {
    #[serde(default)]
    pub message_type: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub sequence_id: i64,
    #[serde(default)]
    pub fcm_data: Value,
}

/// Reply to a successful LOGON.
#[derive(Debug, Serialize)]
pub struct LogonResponse<'a> {
    pub message_type: &'static str,
    pub session_id: &'a str,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
}

/// A connection that has not presented a LOGON yet. Dropping it closes
/// the write half and stops the reader task.
pub struct PendingConn {
    pub peer: SocketAddr,
    pub writer: OwnedWriteHalf,
    pub stop_tx: mpsc::Sender<()>,
}

/// One configured BAL client. The session record and its message
/// manager live for the whole process; the transport comes and goes.
pub struct BalSession {
    pub session_id: String,
    pub state: SessionState,
    pub conn_id: Option<u64>,
    writer: Option<OwnedWriteHalf>,
    _stop_tx: Option<mpsc::Sender<()>>,
    pub manager: crate::manager::MessageManager,
}

impl BalSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let manager = crate::manager::MessageManager::new(
            session_id.clone(),
            crate::message::MAX_PENDING_MESSAGES,
        );
        Self {
            session_id,
            state: SessionState::Unauthenticated,
            conn_id: None,
            writer: None,
            _stop_tx: None,
            manager,
        }
    }

    pub fn attach(&mut self, conn_id: u64, writer: OwnedWriteHalf, stop_tx: mpsc::Sender<()>) {
        self.conn_id = Some(conn_id);
        self.writer = Some(writer);
        self._stop_tx = Some(stop_tx);
        self.state = SessionState::Authenticated;
    }

    /// Drop the transport but keep the manager so pending messages can
    /// replay on reconnect.
    pub fn detach(&mut self) {
        self.conn_id = None;
        self.writer = None;
        self._stop_tx = None;
        self.state = SessionState::Unauthenticated;
    }

    pub async fn write(&mut self, doc: &Value) -> anyhow::Result<()> {
        if self.state != SessionState::Authenticated {
            anyhow::bail!(
                "session '{}' is not connected, will try later",
                self.session_id
            );
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("session '{}' has no transport", self.session_id))?;
        write_frame(writer, doc).await?;
        Ok(())
    }
}

pub async fn write_frame<W>(writer: &mut W, doc: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = doc.to_string().into_bytes();
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Accept BAL connections forever, handing each to the core via events.
pub fn spawn_accept_loop(listener: TcpListener, events: mpsc::Sender<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_conn_id: u64 = 0;
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("failed to accept BAL connection: {e}");
                    continue;
                }
            };
            next_conn_id += 1;
            let conn_id = next_conn_id;
            info!(conn_id, %peer, "new BAL connection");

            let (read_half, write_half) = socket.into_split();
            let (stop_tx, stop_rx) = mpsc::channel(1);

            if events
                .send(Event::BalConnected {
                    conn_id,
                    peer,
                    writer: write_half,
                    stop_tx,
                })
                .await
                .is_err()
            {
                return; // core is gone, stop accepting
            }

            // the reader is spawned after the connected event so its
            // frames always arrive second
            tokio::spawn(read_frames(conn_id, read_half, stop_rx, events.clone()));

            let timeout_events = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AUTH_TIMEOUT).await;
                let _ = timeout_events.send(Event::BalAuthTimeout { conn_id }).await;
            });
        }
    })
}

async fn read_frames<R>(
    conn_id: u64,
    mut reader: R,
    mut stop_rx: mpsc::Receiver<()>,
    events: mpsc::Sender<Event>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!(conn_id, "BAL reader stopped");
                return;
            }
            frame = read_frame(conn_id, &mut reader) => match frame {
                FrameRead::Frame(frame) => {
                    if events.send(Event::BalFrame { conn_id, frame }).await.is_err() {
                        return;
                    }
                }
                FrameRead::Skip => {}
                FrameRead::Closed => {
                    let _ = events.send(Event::BalDisconnected { conn_id }).await;
                    return;
                }
            }
        }
    }
}

enum FrameRead {
    Frame(BalFrame),
    /// Malformed JSON: drop the frame, keep the connection.
    Skip,
    Closed,
}

async fn read_frame<R>(conn_id: u64, reader: &mut R) -> FrameRead
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if reader.read_exact(&mut len_buf).await.is_err() {
        return FrameRead::Closed;
    }
    let len = u32::from_be_bytes(len_buf);
    if len == 0 || len > MAX_FRAME_LEN {
        warn!(conn_id, len, "invalid BAL frame length, dropping connection");
        return FrameRead::Closed;
    }
    let mut payload = vec![0u8; len as usize];
    if reader.read_exact(&mut payload).await.is_err() {
        return FrameRead::Closed;
    }
    match serde_json::from_slice::<BalFrame>(&payload) {
        Ok(frame) => FrameRead::Frame(frame),
        Err(e) => {
            warn!(conn_id, "malformed BAL frame, dropping it: {e}");
            FrameRead::Skip
        }
    }
}
