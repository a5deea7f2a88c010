//! The gateway core: owns every business transition.
//!
//! All state mutation happens here, driven by one event channel. The FCM
//! side is one active link (plus possibly a draining predecessor whose
//! acks are still honoured); the BAL side is a registry of configured
//! sessions, each with its own message manager. Every message hop is
//! gated by an admission check and persisted before the wire write.

use crate::bal::{BalFrame, BalSession, LogonResponse, PendingConn, RESEND_KICK_DELAY};
use crate::config::GatewayConfig;
use crate::event::Event;
use crate::manager::{Admission, MessageManager};
use crate::message::{
    envelope_fields, fcm_fields, Message, MessageKind, MessageState, FCM_SESSION_ID,
    MAX_PENDING_MESSAGES,
};
use crate::store::Store;

use anyhow::Result;
use ccs_link::{FcmLink, LinkEvent, LinkHandle, LinkId};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Nack errors worth retrying with backoff; everything else is final.
const RETRYABLE_NACKS: [&str; 5] = [
    "SERVICE_UNAVAILABLE",
    "INTERNAL_SERVER_ERROR",
    "DEVICE_MESSAGE_RATE_EXCEEDED",
    "TOPICS_MESSAGE_RATE_EXCEEDED",
    "CONNECTION_DRAINING",
];

pub struct Core {
    config: GatewayConfig,
    store: Store,
    events_tx: mpsc::Sender<Event>,
    /// Shared by every link this core spawns; a forwarder task wraps
    /// each LinkEvent into Event::Link.
    link_events_tx: mpsc::Sender<LinkEvent>,
    fcm_manager: MessageManager,
    sessions: HashMap<String, BalSession>,
    pending_conns: HashMap<u64, PendingConn>,
    /// conn_id -> session_id for authenticated connections.
    conn_sessions: HashMap<u64, String>,
    active_link: Option<LinkHandle>,
    draining_links: Vec<LinkHandle>,
    link_count: LinkId,
}

impl Core {
    pub fn new(config: GatewayConfig, store: Store, events_tx: mpsc::Sender<Event>) -> Self {
        let (link_events_tx, mut link_events_rx) = mpsc::channel(256);
        let forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = link_events_rx.recv().await {
                if forward.send(Event::Link(event)).await.is_err() {
                    break;
                }
            }
        });

        let mut sessions = HashMap::new();
        sessions.insert(
            config.bal_session_id.clone(),
            BalSession::new(config.bal_session_id.clone()),
        );

        Self {
            config,
            store,
            events_tx,
            link_events_tx,
            fcm_manager: MessageManager::new(FCM_SESSION_ID, MAX_PENDING_MESSAGES),
            sessions,
            pending_conns: HashMap::new(),
            conn_sessions: HashMap::new(),
            active_link: None,
            draining_links: Vec::new(),
            link_count: 0,
        }
    }

    /// Reload NEW and PENDING_ACK rows into the managers before any
    /// connection is made.
    pub async fn load_pending(&mut self) -> Result<()> {
        info!("Loading pending downstream messages...");
        for msg in self.store.load_pending(FCM_SESSION_ID).await? {
            debug!(
                "loaded {} (entered {}, last update {})",
                msg.identifier(),
                msg.entered_at,
                msg.last_update_at
            );
            self.fcm_manager.add(msg);
        }
        info!(
            "Loaded [{}] pending downstream messages",
            self.fcm_manager.len()
        );

        for (session_id, session) in self.sessions.iter_mut() {
            info!("Loading pending messages for BAL session [{session_id}]...");
            for msg in self.store.load_pending(session_id).await? {
                session.manager.add(msg);
            }
            info!(
                "Loaded [{}] pending messages for BAL session [{session_id}]",
                session.manager.len()
            );
        }
        Ok(())
    }

    /// Open the first (or a replacement) connection to FCM.
    pub fn connect_fcm(&mut self) {
        self.link_count += 1;
        let id = self.link_count;
        info!(link = id, "Connecting to FCM server...");
        let handle = FcmLink::spawn(id, self.config.fcm.clone(), self.link_events_tx.clone());
        self.active_link = Some(handle);
    }

    pub async fn run(&mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            if matches!(event, Event::Shutdown) {
                self.shutdown().await;
                break;
            }
            // a single bad message must never take the process down
            if let Err(e) = self.handle_event(event).await {
                error!("event handler failed: {e:#}");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down: closing FCM links");
        if let Some(link) = self.active_link.take() {
            link.shutdown().await;
        }
        for link in self.draining_links.drain(..) {
            link.shutdown().await;
        }
        // leave the links a beat to write the closing stream tag
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Link(link_event) => self.handle_link_event(link_event).await,
            Event::BalConnected {
                conn_id,
                peer,
                writer,
                stop_tx,
            } => {
                self.pending_conns.insert(
                    conn_id,
                    PendingConn {
                        peer,
                        writer,
                        stop_tx,
                    },
                );
                Ok(())
            }
            Event::BalFrame { conn_id, frame } => self.handle_bal_frame(conn_id, frame).await,
            Event::BalDisconnected { conn_id } => {
                self.handle_bal_disconnected(conn_id);
                Ok(())
            }
            Event::BalAuthTimeout { conn_id } => {
                if let Some(conn) = self.pending_conns.remove(&conn_id) {
                    warn!(
                        conn_id,
                        peer = %conn.peer,
                        "no LOGON within the timeout, discarding connection"
                    );
                }
                Ok(())
            }
            Event::RetryDownstream { sequence_id } => {
                self.handle_retry_downstream(sequence_id).await
            }
            Event::RetryToBal {
                session_id,
                sequence_id,
            } => self.handle_retry_to_bal(&session_id, sequence_id).await,
            Event::ResendPendingToBal { session_id } => {
                self.resend_pending_to_bal(&session_id).await
            }
            Event::Shutdown => Ok(()),
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) -> Result<()> {
        match event {
            LinkEvent::Started(id) => info!(link = id, "Connecting to FCM server..."),
            LinkEvent::Established(id) => {
                info!(link = id, "Secure TLS channel established with FCM server")
            }
            LinkEvent::HandshakeStarted(id) => {
                info!(link = id, "Starting XMPP handshake, opening stream...")
            }
            LinkEvent::Heartbeat(id) => debug!(link = id, "keepalive from FCM"),
            LinkEvent::StreamClosed(id) => info!(link = id, "received stream end from FCM"),
            LinkEvent::ConnectionLost(id) => warn!(link = id, "connection to FCM lost"),
            LinkEvent::LinkError(id, err) => error!(link = id, "FCM link error: {err}"),
            LinkEvent::SessionEstablished(id) => {
                info!(
                    link = id,
                    server_id = %self.config.fcm.server_id,
                    "session with FCM established"
                );
                if self.active_link.as_ref().map(LinkHandle::id) == Some(id) {
                    self.resend_all_pending_downstream().await?;
                }
            }
            LinkEvent::DrainingStarted(id) => self.handle_draining_started(id),
            LinkEvent::DrainingCompleted(id) => {
                self.draining_links.retain(|link| link.id() != id);
                info!(link = id, "draining connection closed by FCM");
            }
            LinkEvent::Upstream(id, json) => {
                debug!(link = id, "upstream message received");
                self.handle_upstream(json).await?;
            }
            LinkEvent::Ack(_, json) => self.handle_fcm_ack(json).await?,
            LinkEvent::Nack(_, json) => self.handle_fcm_nack(json).await?,
            LinkEvent::Receipt(_, json) => self.handle_fcm_receipt(json).await?,
        }
        Ok(())
    }

    /// CCS is about to close this connection for load balancing. Route
    /// outbound traffic to a fresh link immediately; the old one stays
    /// alive to deliver acks until the server closes it.
    fn handle_draining_started(&mut self, id: LinkId) {
        info!(link = id, "connection draining started");
        match self.active_link.take() {
            Some(active) if active.id() == id => {
                self.draining_links.push(active);
                info!("creating a replacement connection to FCM");
                self.connect_fcm();
            }
            other => {
                debug!(link = id, "draining on a non-active link, nothing to switch");
                self.active_link = other;
            }
        }
    }

    // ---- FCM -> BAL ----

    async fn handle_upstream(&mut self, json: Value) -> Result<()> {
        let from = json_str(&json, fcm_fields::FROM);
        let session_id = json_str(&json, fcm_fields::CATEGORY);
        let fcm_mid = json_str(&json, fcm_fields::MESSAGE_ID);
        info!("received upstream message [{fcm_mid}] from [{from}] for session [{session_id}]");

        let ack = json!({
            (fcm_fields::TO): from,
            (fcm_fields::MESSAGE_ID): fcm_mid,
            (fcm_fields::MESSAGE_TYPE): "ack",
        });

        let sequence_id = self.store.next_sequence_id();
        let envelope = json!({
            (envelope_fields::MESSAGE_TYPE): MessageKind::Upstream.wire_name(),
            (envelope_fields::SEQUENCE_ID): sequence_id,
            (envelope_fields::SESSION_ID): session_id,
            (envelope_fields::FCM_DATA): json,
        });
        let msg = Message::new(
            sequence_id,
            MessageKind::Upstream,
            fcm_mid.clone(),
            "",
            FCM_SESSION_ID,
            session_id.clone(),
            envelope,
        );
        self.store.save(&msg).await?;

        // Ack every upstream as soon as it is safely stored; an unacked
        // message is retransmitted by CCS on the next connection.
        self.send_to_fcm(ack).await;

        self.forward_to_bal(&session_id, msg).await;
        Ok(())
    }

    async fn handle_fcm_receipt(&mut self, json: Value) -> Result<()> {
        let session_id = json_str(&json, fcm_fields::CATEGORY);
        let fcm_mid = json_str(&json, fcm_fields::MESSAGE_ID);
        info!("received delivery receipt for [{fcm_mid}], session [{session_id}]");

        let sequence_id = self.store.next_sequence_id();
        let envelope = json!({
            (envelope_fields::MESSAGE_TYPE): MessageKind::DownstreamReceipt.wire_name(),
            (envelope_fields::SEQUENCE_ID): sequence_id,
            (envelope_fields::SESSION_ID): session_id,
            (envelope_fields::FCM_DATA): json,
        });
        let msg = Message::new(
            sequence_id,
            MessageKind::DownstreamReceipt,
            fcm_mid,
            "",
            FCM_SESSION_ID,
            session_id.clone(),
            envelope,
        );
        self.store.save(&msg).await?;
        self.forward_to_bal(&session_id, msg).await;
        Ok(())
    }

    /// Track a BAL-bound message and push it out if admission allows.
    async fn forward_to_bal(&mut self, session_id: &str, msg: Message) {
        let sequence_id = msg.sequence_id;
        let identifier = msg.identifier();
        let Some(session) = self.sessions.get_mut(session_id) else {
            error!("unknown BAL session [{session_id}], message {identifier} dropped");
            return;
        };
        session.manager.add(msg);
        let admission = match session.manager.get(sequence_id) {
            Some(msg) => session.manager.can_send_new(msg),
            None => return,
        };
        match admission {
            Admission::Ok => {
                if let Err(e) = self
                    .store
                    .update_state(sequence_id, MessageState::PendingAck)
                    .await
                {
                    error!("failed to persist state of {identifier}: {e:#}");
                    return;
                }
                session.manager.mark_pending(sequence_id);
                let payload = session.manager.get(sequence_id).map(|m| m.payload.clone());
                if let Some(payload) = payload {
                    if let Err(e) = session.write(&payload).await {
                        // stays PENDING_ACK and replays on reconnect
                        warn!("could not forward {identifier}: {e:#}");
                    }
                }
            }
            Admission::PendingFull => warn!(
                session = session_id,
                "pending-ack window full, message {identifier} stays queued"
            ),
            Admission::GroupBlocked => {
                debug!("message {identifier} waits for its group head to be acked")
            }
            Admission::WrongState => {
                warn!("message {identifier} is not in the NEW state, not forwarding")
            }
        }
    }

    // ---- BAL -> FCM ----

    async fn handle_bal_frame(&mut self, conn_id: u64, frame: BalFrame) -> Result<()> {
        match frame.message_type.as_str() {
            "LOGON" => self.handle_logon(conn_id, frame).await,
            "DOWNSTREAM" => {
                let Some(session_id) = self.conn_sessions.get(&conn_id).cloned() else {
                    warn!(conn_id, "DOWNSTREAM from an unauthenticated connection, ignored");
                    return Ok(());
                };
                self.handle_bal_downstream(&session_id, frame).await
            }
            "ACK" => {
                let Some(session_id) = self.conn_sessions.get(&conn_id).cloned() else {
                    warn!(conn_id, "ACK from an unauthenticated connection, ignored");
                    return Ok(());
                };
                self.handle_bal_ack(&session_id, frame.sequence_id).await
            }
            other => {
                warn!(conn_id, "unknown BAL message type <{other}>, ignored");
                Ok(())
            }
        }
    }

    async fn handle_logon(&mut self, conn_id: u64, frame: BalFrame) -> Result<()> {
        let Some(pending) = self.pending_conns.remove(&conn_id) else {
            warn!(conn_id, "LOGON from a connection not awaiting authentication");
            return Ok(());
        };
        let session_id = frame.session_id;
        let Some(session) = self.sessions.get_mut(&session_id) else {
            error!(
                conn_id,
                session = %session_id,
                "unknown BAL session on LOGON, dropping connection \
                 (is the session in the config file?)"
            );
            return Ok(()); // dropping `pending` closes the socket
        };

        // a reconnect replaces any stale transport
        if let Some(old_conn) = session.conn_id.take() {
            self.conn_sessions.remove(&old_conn);
        }
        session.attach(conn_id, pending.writer, pending.stop_tx);
        self.conn_sessions.insert(conn_id, session_id.clone());

        let reply = serde_json::to_value(LogonResponse {
            message_type: MessageKind::LogonResponse.wire_name(),
            session_id: &session_id,
            status: "SUCCESS",
        })?;
        if let Err(e) = session.write(&reply).await {
            warn!("failed to send LOGON_RESPONSE: {e:#}");
        }
        info!(
            conn_id,
            peer = %pending.peer,
            session = %session_id,
            "BAL client authenticated"
        );

        // give the client a moment to settle, then replay its queue
        let events = self.events_tx.clone();
        let kick_session = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESEND_KICK_DELAY).await;
            let _ = events
                .send(Event::ResendPendingToBal {
                    session_id: kick_session,
                })
                .await;
        });
        Ok(())
    }

    async fn handle_bal_downstream(&mut self, session_id: &str, frame: BalFrame) -> Result<()> {
        if !frame.fcm_data.is_object() {
            warn!(
                session = session_id,
                "DOWNSTREAM without an fcm_data object, frame dropped"
            );
            return Ok(());
        }
        let fcm_mid = json_str(&frame.fcm_data, fcm_fields::MESSAGE_ID);
        let sequence_id = self.store.next_sequence_id();
        let msg = Message::new(
            sequence_id,
            MessageKind::Downstream,
            fcm_mid,
            frame.group_id,
            session_id,
            FCM_SESSION_ID,
            frame.fcm_data,
        );
        info!(
            "new downstream message {} from session [{session_id}]",
            msg.identifier()
        );
        self.store.save(&msg).await?;
        self.fcm_manager.add(msg);
        self.admit_downstream(sequence_id).await
    }

    async fn admit_downstream(&mut self, sequence_id: i64) -> Result<()> {
        let admission = match self.fcm_manager.get(sequence_id) {
            Some(msg) => self.fcm_manager.can_send_new(msg),
            None => return Ok(()),
        };
        match admission {
            Admission::Ok => {
                self.store
                    .update_state(sequence_id, MessageState::PendingAck)
                    .await?;
                self.fcm_manager.mark_pending(sequence_id);
                self.upload_to_fcm(sequence_id).await;
            }
            Admission::PendingFull => warn!(
                "pending-ack window to FCM is full ({}), message seq:{sequence_id} stays queued",
                self.fcm_manager.pending_ack_count()
            ),
            Admission::GroupBlocked => {
                debug!("message seq:{sequence_id} waits for its group head to be acked")
            }
            Admission::WrongState => {
                warn!("message seq:{sequence_id} is not in the NEW state, not uploading")
            }
        }
        Ok(())
    }

    async fn upload_to_fcm(&self, sequence_id: i64) {
        if let Some(msg) = self.fcm_manager.get(sequence_id) {
            debug!("uploading {} to FCM", msg.identifier());
            let payload = msg.payload.clone();
            self.send_to_fcm(payload).await;
        }
    }

    async fn send_to_fcm(&self, payload: Value) {
        match &self.active_link {
            Some(link) => {
                if !link.send(payload).await {
                    warn!("active FCM link is gone, message will go out on resend");
                }
            }
            None => warn!("no active FCM link, message will go out on resend"),
        }
    }

    // ---- acks, nacks, receipts for downstream messages ----

    async fn handle_fcm_ack(&mut self, json: Value) -> Result<()> {
        let fcm_mid = json_str(&json, fcm_fields::MESSAGE_ID);
        info!("received downstream ack from FCM for [{fcm_mid}]");
        let Some(sequence_id) = self.fcm_manager.find_by_fcm_id(&fcm_mid) else {
            warn!("ack for unknown message id [{fcm_mid}], dropped");
            return Ok(());
        };

        self.store
            .update_state(sequence_id, MessageState::Delivered)
            .await?;
        let Some(delivered) = self.fcm_manager.remove(sequence_id) else {
            return Ok(());
        };

        // a window slot just opened
        self.pull_next_downstream().await?;

        // relay the ack to the session that uploaded the message
        let source = delivered.source_session_id.clone();
        let ack_seq = self.store.next_sequence_id();
        let envelope = json!({
            (envelope_fields::MESSAGE_TYPE): MessageKind::DownstreamAck.wire_name(),
            (envelope_fields::SEQUENCE_ID): ack_seq,
            (envelope_fields::SESSION_ID): source,
            (envelope_fields::FCM_DATA): json,
        });
        let relay = Message::new(
            ack_seq,
            MessageKind::DownstreamAck,
            fcm_mid,
            "",
            FCM_SESSION_ID,
            source.clone(),
            envelope,
        );
        self.store.save(&relay).await?;
        self.forward_to_bal(&source, relay).await;
        Ok(())
    }

    async fn handle_fcm_nack(&mut self, json: Value) -> Result<()> {
        let fcm_mid = json_str(&json, fcm_fields::MESSAGE_ID);
        let error = json_str(&json, fcm_fields::ERROR);
        let error_desc = json_str(&json, fcm_fields::ERROR_DESC);
        warn!("received nack for [{fcm_mid}]: {error} ({error_desc})");

        let Some(sequence_id) = self.fcm_manager.find_by_fcm_id(&fcm_mid) else {
            warn!("nack for unknown message id [{fcm_mid}], dropped");
            return Ok(());
        };
        if RETRYABLE_NACKS.contains(&error.as_str()) {
            self.schedule_downstream_retry(sequence_id).await
        } else {
            self.fail_downstream(sequence_id, &error_desc).await
        }
    }

    async fn schedule_downstream_retry(&mut self, sequence_id: i64) -> Result<()> {
        let Some(msg) = self.fcm_manager.get_mut(sequence_id) else {
            return Ok(());
        };
        if msg.retry_scheduled {
            debug!("retry already scheduled for {}", msg.identifier());
            return Ok(());
        }
        match msg.retry.next() {
            Some(delay) => {
                msg.retry_scheduled = true;
                info!(
                    "retrying {} in {delay:?} (attempt {})",
                    msg.identifier(),
                    msg.retry.retries()
                );
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Event::RetryDownstream { sequence_id }).await;
                });
                Ok(())
            }
            None => self.fail_downstream(sequence_id, "Max retry reached.").await,
        }
    }

    async fn handle_retry_downstream(&mut self, sequence_id: i64) -> Result<()> {
        // the message may have been acked or failed while the timer ran
        let Some(msg) = self.fcm_manager.get_mut(sequence_id) else {
            debug!("retry fired for seq:{sequence_id}, no longer tracked");
            return Ok(());
        };
        msg.retry_scheduled = false;
        // state stays PENDING_ACK across retries
        self.upload_to_fcm(sequence_id).await;
        Ok(())
    }

    async fn fail_downstream(&mut self, sequence_id: i64, error_desc: &str) -> Result<()> {
        error!("dropping downstream message seq:{sequence_id}: {error_desc}");
        self.store
            .update_state(sequence_id, MessageState::DeliveryFailed)
            .await?;
        let Some(failed) = self.fcm_manager.remove(sequence_id) else {
            return Ok(());
        };
        self.pull_next_downstream().await?;
        self.notify_downstream_reject(failed, error_desc).await
    }

    /// Tell the uploading session its message is gone for good. The BAL
    /// gets the reject envelope, with the original payload under
    /// fcm_data.
    async fn notify_downstream_reject(&mut self, failed: Message, error_desc: &str) -> Result<()> {
        let source = failed.source_session_id.clone();
        let reject_seq = self.store.next_sequence_id();
        let envelope = json!({
            (envelope_fields::MESSAGE_TYPE): MessageKind::DownstreamReject.wire_name(),
            (envelope_fields::SEQUENCE_ID): reject_seq,
            (envelope_fields::SESSION_ID): source,
            (envelope_fields::ERROR_DESC): error_desc,
            (envelope_fields::FCM_DATA): failed.payload,
        });
        let reject = Message::new(
            reject_seq,
            MessageKind::DownstreamReject,
            failed.fcm_message_id.clone(),
            "",
            FCM_SESSION_ID,
            source.clone(),
            envelope,
        );
        self.store.save(&reject).await?;
        self.forward_to_bal(&source, reject).await;
        Ok(())
    }

    async fn pull_next_downstream(&mut self) -> Result<()> {
        if let Some(next) = self.fcm_manager.next_sendable() {
            debug!("window slot freed, sending queued downstream seq:{next}");
            self.store
                .update_state(next, MessageState::PendingAck)
                .await?;
            self.fcm_manager.mark_pending(next);
            self.upload_to_fcm(next).await;
        }
        Ok(())
    }

    // ---- BAL acks and reconnect replay ----

    async fn handle_bal_ack(&mut self, session_id: &str, sequence_id: i64) -> Result<()> {
        info!("received ack for seq:{sequence_id} from session [{session_id}]");
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        if session.manager.get(sequence_id).is_none() {
            warn!(
                session = session_id,
                "ack for unknown seq:{sequence_id}, dropped"
            );
            return Ok(());
        }
        self.store
            .update_state(sequence_id, MessageState::Delivered)
            .await?;
        session.manager.remove(sequence_id);

        // push whatever the freed slot or group head unblocked
        if let Some(next) = session.manager.next_sendable() {
            self.store
                .update_state(next, MessageState::PendingAck)
                .await?;
            session.manager.mark_pending(next);
            let payload = session.manager.get(next).map(|m| m.payload.clone());
            if let Some(payload) = payload {
                if let Err(e) = session.write(&payload).await {
                    warn!("could not forward seq:{next}: {e:#}");
                }
            }
        }
        Ok(())
    }

    /// After (re)establishing the FCM session, re-upload every tracked
    /// downstream message in NEW or PENDING_ACK. CCS deduplicates by its
    /// own message id within the delivery window.
    async fn resend_all_pending_downstream(&mut self) -> Result<()> {
        info!(
            "resending pending downstream messages ({} tracked)",
            self.fcm_manager.len()
        );
        for sequence_id in self.fcm_manager.sequence_ids() {
            let (kind, state, admission) = {
                let Some(msg) = self.fcm_manager.get(sequence_id) else {
                    continue;
                };
                (msg.kind, msg.state, self.fcm_manager.can_send_on_reconnect(msg))
            };
            if kind != MessageKind::Downstream {
                warn!("non-downstream message seq:{sequence_id} tracked for fcm, skipping");
                continue;
            }
            match admission {
                Admission::Ok => {
                    if state != MessageState::PendingAck {
                        self.store
                            .update_state(sequence_id, MessageState::PendingAck)
                            .await?;
                        self.fcm_manager.mark_pending(sequence_id);
                    }
                    self.upload_to_fcm(sequence_id).await;
                }
                Admission::PendingFull => self.schedule_downstream_retry(sequence_id).await?,
                Admission::GroupBlocked | Admission::WrongState => {}
            }
        }
        Ok(())
    }

    /// The 1s-after-LOGON kick: replay every BAL-bound message for the
    /// session.
    async fn resend_pending_to_bal(&mut self, session_id: &str) -> Result<()> {
        let Some(session) = self.sessions.get(session_id) else {
            return Ok(());
        };
        info!(
            "replaying pending messages for session [{session_id}] ({} tracked)",
            session.manager.len()
        );
        for sequence_id in session.manager.sequence_ids() {
            self.resend_one_to_bal(session_id, sequence_id).await?;
        }
        Ok(())
    }

    async fn resend_one_to_bal(&mut self, session_id: &str, sequence_id: i64) -> Result<()> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        let (bal_bound, state, admission) = {
            let Some(msg) = session.manager.get(sequence_id) else {
                return Ok(());
            };
            (
                msg.kind.is_bal_bound(),
                msg.state,
                session.manager.can_send_on_reconnect(msg),
            )
        };
        if !bal_bound {
            return Ok(());
        }
        match admission {
            Admission::Ok => {
                if state != MessageState::PendingAck {
                    self.store
                        .update_state(sequence_id, MessageState::PendingAck)
                        .await?;
                    session.manager.mark_pending(sequence_id);
                }
                let payload = session.manager.get(sequence_id).map(|m| m.payload.clone());
                if let Some(payload) = payload {
                    if let Err(e) = session.write(&payload).await {
                        warn!("could not replay seq:{sequence_id}: {e:#}");
                    }
                }
            }
            Admission::PendingFull => self.schedule_bal_retry(session_id, sequence_id).await?,
            Admission::GroupBlocked => {
                // another message of the group is in flight; the next ack
                // will advance the queue
            }
            Admission::WrongState => {
                session.manager.remove(sequence_id);
            }
        }
        Ok(())
    }

    async fn schedule_bal_retry(&mut self, session_id: &str, sequence_id: i64) -> Result<()> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        let Some(msg) = session.manager.get_mut(sequence_id) else {
            return Ok(());
        };
        if msg.retry_scheduled {
            return Ok(());
        }
        match msg.retry.next() {
            Some(delay) => {
                msg.retry_scheduled = true;
                let events = self.events_tx.clone();
                let retry_session = session_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events
                        .send(Event::RetryToBal {
                            session_id: retry_session,
                            sequence_id,
                        })
                        .await;
                });
            }
            None => {
                error!(
                    session = session_id,
                    "unable to deliver seq:{sequence_id}, max retry reached"
                );
                self.store
                    .update_state(sequence_id, MessageState::DeliveryFailed)
                    .await?;
                session.manager.remove(sequence_id);
            }
        }
        Ok(())
    }

    async fn handle_retry_to_bal(&mut self, session_id: &str, sequence_id: i64) -> Result<()> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Ok(());
        };
        let Some(msg) = session.manager.get_mut(sequence_id) else {
            debug!("BAL retry fired for seq:{sequence_id}, no longer tracked");
            return Ok(());
        };
        msg.retry_scheduled = false;
        self.resend_one_to_bal(session_id, sequence_id).await
    }

    fn handle_bal_disconnected(&mut self, conn_id: u64) {
        if self.pending_conns.remove(&conn_id).is_some() {
            info!(conn_id, "unauthenticated BAL connection lost");
            return;
        }
        if let Some(session_id) = self.conn_sessions.remove(&conn_id) {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                if session.conn_id == Some(conn_id) {
                    session.detach();
                    info!(
                        session = %session_id,
                        "authenticated session lost, pending queue retained for reconnect"
                    );
                }
            }
        }
    }
}

fn json_str(json: &Value, key: &str) -> String {
    json.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MAX_DOWNSTREAM_UPLOAD_RETRY;
    use ccs_link::{CcsConfig, LinkCommand};
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn test_core() -> (
        Core,
        mpsc::Receiver<Event>,
        mpsc::Receiver<LinkCommand>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir
            .path()
            .join("gateway.db")
            .to_string_lossy()
            .into_owned();
        let config = GatewayConfig {
            fcm: CcsConfig {
                server_id: "sender-1".into(),
                server_key: "key-1".into(),
                host: "127.0.0.1".into(),
                port: 5235,
            },
            listen_host: "127.0.0.1".into(),
            listen_port: 0,
            bal_session_id: "balA".into(),
            db_path: db_path.clone(),
        };
        let store = Store::open(&db_path).await.expect("store");
        let (events_tx, events_rx) = mpsc::channel(256);
        let mut core = Core::new(config, store, events_tx);

        // observable stand-in for a connected, authenticated link
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        core.active_link = Some(LinkHandle::from_parts(1, cmd_tx));
        core.link_count = 1;
        (core, events_rx, cmd_rx, dir)
    }

    /// Connect a fake BAL client end-to-end: real sockets, LOGON through
    /// the normal dispatch path.
    async fn attach_bal(core: &mut Core, conn_id: u64) -> TcpStream {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).await.expect("connect");
        let (server, peer) = listener.accept().await.expect("accept");
        let (_read_half, write_half) = server.into_split();
        let (stop_tx, _stop_rx) = mpsc::channel(1);
        core.pending_conns.insert(
            conn_id,
            PendingConn {
                peer,
                writer: write_half,
                stop_tx,
            },
        );
        core.handle_bal_frame(
            conn_id,
            BalFrame {
                message_type: "LOGON".into(),
                session_id: "balA".into(),
                ..Default::default()
            },
        )
        .await
        .expect("logon");
        client
    }

    async fn read_bal_frame(client: &mut TcpStream) -> Value {
        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.expect("length");
        let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        client.read_exact(&mut payload).await.expect("payload");
        serde_json::from_slice(&payload).expect("json")
    }

    fn downstream_frame(fcm_mid: &str, group: &str) -> BalFrame {
        BalFrame {
            message_type: "DOWNSTREAM".into(),
            group_id: group.into(),
            fcm_data: json!({"to": "d1", "message_id": fcm_mid, "data": {}}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upstream_is_acked_persisted_and_forwarded() {
        let (mut core, _events_rx, mut fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let logon = read_bal_frame(&mut client).await;
        assert_eq!(logon["message_type"], "LOGON_RESPONSE");
        assert_eq!(logon["status"], "SUCCESS");

        let upstream = json!({
            "from": "d1", "category": "balA", "message_id": "u1", "data": {"k": "v"}
        });
        core.handle_link_event(LinkEvent::Upstream(1, upstream))
            .await
            .expect("upstream");

        // the ack to FCM is written before the BAL forward
        match fcm_rx.recv().await.expect("ack") {
            LinkCommand::Send(ack) => {
                assert_eq!(ack["message_type"], "ack");
                assert_eq!(ack["to"], "d1");
                assert_eq!(ack["message_id"], "u1");
            }
            other => panic!("expected send, got {other:?}"),
        }

        let frame = read_bal_frame(&mut client).await;
        assert_eq!(frame["message_type"], "UPSTREAM");
        assert_eq!(frame["sequence_id"], 1);
        assert_eq!(frame["session_id"], "balA");
        assert_eq!(frame["fcm_data"]["message_id"], "u1");

        let session = core.sessions.get("balA").expect("session");
        assert_eq!(session.manager.pending_ack_count(), 1);

        // BAL acks by sequence id: delivered and dropped from tracking
        core.handle_bal_frame(
            1,
            BalFrame {
                message_type: "ACK".into(),
                sequence_id: 1,
                ..Default::default()
            },
        )
        .await
        .expect("ack");
        let session = core.sessions.get("balA").expect("session");
        assert!(session.manager.is_empty());
        assert!(core.store.load_pending("balA").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn downstream_ack_relays_envelope_to_bal() {
        let (mut core, _events_rx, mut fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await; // LOGON_RESPONSE

        core.handle_bal_frame(1, downstream_frame("m1", ""))
            .await
            .expect("downstream");
        match fcm_rx.recv().await.expect("upload") {
            LinkCommand::Send(doc) => assert_eq!(doc["message_id"], "m1"),
            other => panic!("expected send, got {other:?}"),
        }
        assert_eq!(core.fcm_manager.pending_ack_count(), 1);

        core.handle_link_event(LinkEvent::Ack(
            1,
            json!({"message_type": "ack", "message_id": "m1", "from": "d1"}),
        ))
        .await
        .expect("fcm ack");
        assert!(core.fcm_manager.is_empty());

        let frame = read_bal_frame(&mut client).await;
        assert_eq!(frame["message_type"], "DOWNSTREAM_ACK");
        assert_eq!(frame["session_id"], "balA");
        assert_eq!(frame["sequence_id"], 2);
        assert_eq!(frame["fcm_data"]["message_id"], "m1");
    }

    #[tokio::test(start_paused = true)]
    async fn reject_envelope_reaches_bal() {
        let (mut core, mut events_rx, mut fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        let original = json!({"to": "d1", "message_id": "m1", "data": {"p": 1}});
        core.handle_bal_frame(
            1,
            BalFrame {
                message_type: "DOWNSTREAM".into(),
                fcm_data: original.clone(),
                ..Default::default()
            },
        )
        .await
        .expect("downstream");
        let _ = fcm_rx.recv().await.expect("initial upload");

        let nack = json!({
            "message_type": "nack", "message_id": "m1",
            "error": "SERVICE_UNAVAILABLE",
            "error_description": "service not available"
        });
        for _ in 0..MAX_DOWNSTREAM_UPLOAD_RETRY {
            core.handle_link_event(LinkEvent::Nack(1, nack.clone()))
                .await
                .expect("nack");
            // the backoff timer fires and the message is re-uploaded
            let retry = loop {
                match events_rx.recv().await.expect("event") {
                    retry @ Event::RetryDownstream { .. } => break retry,
                    _ => {} // logon kick and friends
                }
            };
            core.handle_event(retry).await.expect("retry");
            match fcm_rx.recv().await.expect("re-upload") {
                LinkCommand::Send(doc) => assert_eq!(doc["message_id"], "m1"),
                other => panic!("expected send, got {other:?}"),
            }
        }

        // the budget is spent: the next nack fails the message for good
        core.handle_link_event(LinkEvent::Nack(1, nack))
            .await
            .expect("final nack");
        assert!(core.fcm_manager.is_empty());

        // the BAL receives the reject envelope, not the original payload
        let frame = read_bal_frame(&mut client).await;
        assert_eq!(frame["message_type"], "DOWNSTREAM_REJECT");
        assert_eq!(frame["error_description"], "Max retry reached.");
        assert_eq!(frame["session_id"], "balA");
        assert_eq!(frame["fcm_data"], original);
        assert!(frame.get("to").is_none());

        let pending = core.store.load_pending(FCM_SESSION_ID).await.unwrap();
        assert!(pending.is_empty(), "failed row must not reload as pending");
    }

    #[tokio::test]
    async fn fatal_nack_rejects_immediately() {
        let (mut core, _events_rx, mut fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        core.handle_bal_frame(1, downstream_frame("m1", ""))
            .await
            .expect("downstream");
        let _ = fcm_rx.recv().await;

        core.handle_link_event(LinkEvent::Nack(
            1,
            json!({
                "message_type": "nack", "message_id": "m1",
                "error": "BAD_REGISTRATION",
                "error_description": "token is gone"
            }),
        ))
        .await
        .expect("nack");

        assert!(core.fcm_manager.is_empty());
        let frame = read_bal_frame(&mut client).await;
        assert_eq!(frame["message_type"], "DOWNSTREAM_REJECT");
        assert_eq!(frame["error_description"], "token is gone");
    }

    #[tokio::test]
    async fn draining_handover_switches_links_and_resends() {
        let (mut core, _events_rx, mut old_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        core.handle_bal_frame(1, downstream_frame("m1", ""))
            .await
            .expect("m1");
        core.handle_bal_frame(1, downstream_frame("m2", ""))
            .await
            .expect("m2");
        let _ = old_rx.recv().await.expect("m1 upload");
        let _ = old_rx.recv().await.expect("m2 upload");

        // draining: outbound routing switches to a new link immediately
        core.handle_link_event(LinkEvent::DrainingStarted(1))
            .await
            .expect("draining");
        assert_eq!(core.draining_links.len(), 1);
        let new_id = core.active_link.as_ref().expect("replacement").id();
        assert_ne!(new_id, 1);

        // swap the freshly spawned link for an observable stand-in
        let (new_tx, mut new_rx) = mpsc::channel(64);
        core.active_link = Some(LinkHandle::from_parts(new_id, new_tx));

        // an ack arriving on the old link still clears its message
        core.handle_link_event(LinkEvent::Ack(
            1,
            json!({"message_type": "ack", "message_id": "m1"}),
        ))
        .await
        .expect("old-link ack");
        assert_eq!(core.fcm_manager.len(), 1);
        let relay = read_bal_frame(&mut client).await;
        assert_eq!(relay["message_type"], "DOWNSTREAM_ACK");

        // new link authenticates: the surviving pending message re-uploads
        core.handle_link_event(LinkEvent::SessionEstablished(new_id))
            .await
            .expect("session");
        match new_rx.recv().await.expect("resend") {
            LinkCommand::Send(doc) => assert_eq!(doc["message_id"], "m2"),
            other => panic!("expected send, got {other:?}"),
        }

        // the server eventually closes the drained connection
        core.handle_link_event(LinkEvent::DrainingCompleted(1))
            .await
            .expect("completed");
        assert!(core.draining_links.is_empty());
    }

    #[tokio::test]
    async fn group_messages_advance_one_at_a_time() {
        let (mut core, _events_rx, mut fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        for mid in ["m1", "m2", "m3"] {
            core.handle_bal_frame(1, downstream_frame(mid, "g"))
                .await
                .expect("downstream");
        }
        // only the group head was uploaded
        match fcm_rx.recv().await.expect("head") {
            LinkCommand::Send(doc) => assert_eq!(doc["message_id"], "m1"),
            other => panic!("expected send, got {other:?}"),
        }
        assert_eq!(core.fcm_manager.pending_ack_count(), 1);
        assert!(fcm_rx.try_recv().is_err());

        // head acked: m2 goes out, then m3
        core.handle_link_event(LinkEvent::Ack(
            1,
            json!({"message_type": "ack", "message_id": "m1"}),
        ))
        .await
        .expect("ack m1");
        match fcm_rx.recv().await.expect("m2") {
            LinkCommand::Send(doc) => assert_eq!(doc["message_id"], "m2"),
            other => panic!("expected send, got {other:?}"),
        }
        let _ = read_bal_frame(&mut client).await; // DOWNSTREAM_ACK for m1

        core.handle_link_event(LinkEvent::Ack(
            1,
            json!({"message_type": "ack", "message_id": "m2"}),
        ))
        .await
        .expect("ack m2");
        match fcm_rx.recv().await.expect("m3") {
            LinkCommand::Send(doc) => assert_eq!(doc["message_id"], "m3"),
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_session_logon_drops_connection() {
        let (mut core, _events_rx, _fcm_rx, _dir) = test_core().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut client = TcpStream::connect(addr).await.expect("connect");
        let (server, peer) = listener.accept().await.expect("accept");
        let (_read_half, write_half) = server.into_split();
        let (stop_tx, _stop_rx) = mpsc::channel(1);
        core.pending_conns.insert(
            9,
            PendingConn {
                peer,
                writer: write_half,
                stop_tx,
            },
        );

        core.handle_bal_frame(
            9,
            BalFrame {
                message_type: "LOGON".into(),
                session_id: "who-is-this".into(),
                ..Default::default()
            },
        )
        .await
        .expect("logon");

        assert!(core.pending_conns.is_empty());
        assert!(core.conn_sessions.is_empty());

        // the write half was dropped, so the client sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.expect("read"), 0);
    }

    #[tokio::test]
    async fn auth_timeout_discards_pending_connection() {
        let (mut core, _events_rx, _fcm_rx, _dir) = test_core().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _client = TcpStream::connect(addr).await.expect("connect");
        let (server, peer) = listener.accept().await.expect("accept");
        let (_read_half, write_half) = server.into_split();
        let (stop_tx, _stop_rx) = mpsc::channel(1);
        core.pending_conns.insert(
            3,
            PendingConn {
                peer,
                writer: write_half,
                stop_tx,
            },
        );

        core.handle_event(Event::BalAuthTimeout { conn_id: 3 })
            .await
            .expect("timeout");
        assert!(core.pending_conns.is_empty());

        // a timeout for an already-authenticated connection is a no-op
        core.handle_event(Event::BalAuthTimeout { conn_id: 3 })
            .await
            .expect("idempotent");
    }

    #[tokio::test]
    async fn disconnect_demotes_session_but_keeps_queue() {
        let (mut core, _events_rx, mut fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        // an upstream lands while connected
        core.handle_link_event(LinkEvent::Upstream(
            1,
            json!({"from": "d1", "category": "balA", "message_id": "u1", "data": {}}),
        ))
        .await
        .expect("upstream");
        let _ = fcm_rx.recv().await.expect("ack to fcm");
        let _ = read_bal_frame(&mut client).await; // delivered over the old conn

        core.handle_event(Event::BalDisconnected { conn_id: 1 })
            .await
            .expect("disconnect");
        let session = core.sessions.get("balA").expect("session");
        assert_eq!(session.state, crate::bal::SessionState::Unauthenticated);
        assert_eq!(session.manager.len(), 1, "queue survives the disconnect");

        // reconnect and replay: the unacked upstream is sent again
        let mut client2 = attach_bal(&mut core, 2).await;
        let _ = read_bal_frame(&mut client2).await; // LOGON_RESPONSE
        core.handle_event(Event::ResendPendingToBal {
            session_id: "balA".into(),
        })
        .await
        .expect("replay");
        let frame = read_bal_frame(&mut client2).await;
        assert_eq!(frame["message_type"], "UPSTREAM");
        assert_eq!(frame["fcm_data"]["message_id"], "u1");
    }

    #[tokio::test]
    async fn ack_for_unknown_ids_is_dropped() {
        let (mut core, _events_rx, _fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        core.handle_link_event(LinkEvent::Ack(
            1,
            json!({"message_type": "ack", "message_id": "never-seen"}),
        ))
        .await
        .expect("fcm ack ignored");

        core.handle_bal_frame(
            1,
            BalFrame {
                message_type: "ACK".into(),
                sequence_id: 42,
                ..Default::default()
            },
        )
        .await
        .expect("bal ack ignored");
    }

    #[tokio::test]
    async fn receipt_is_wrapped_and_forwarded() {
        let (mut core, _events_rx, _fcm_rx, _dir) = test_core().await;
        let mut client = attach_bal(&mut core, 1).await;
        let _ = read_bal_frame(&mut client).await;

        core.handle_link_event(LinkEvent::Receipt(
            1,
            json!({
                "message_type": "receipt", "category": "balA",
                "message_id": "dr2:m1", "from": "d1",
                "data": {"message_status": "MESSAGE_SENT_TO_DEVICE"}
            }),
        ))
        .await
        .expect("receipt");

        let frame = read_bal_frame(&mut client).await;
        assert_eq!(frame["message_type"], "DOWNSTREAM_RECEIPT");
        assert_eq!(frame["session_id"], "balA");
        assert_eq!(frame["fcm_data"]["message_id"], "dr2:m1");
    }
}
