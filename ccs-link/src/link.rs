//! One XMPP connection to FCM CCS.
//!
//! [`FcmLink::spawn`] starts a task that owns the socket for its whole
//! life: TLS bring-up, SASL PLAIN, the post-auth stream restart, resource
//! bind, then steady-state dispatch of acks/nacks/receipts/upstream
//! messages. The task reconnects forever with exponential backoff, except
//! after CONNECTION_DRAINING: a draining link keeps reading until the
//! server closes it and then exits, because its replacement was already
//! started when draining began.

use crate::backoff::Backoff;
use crate::xmpp::{
    auth_stanza, bind_stanza, message_stanza, stream_header, Element, StanzaStream, WireItem,
    STREAM_END,
};
use crate::Error;

use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

const SHUTDOWN_LINGER: Duration = Duration::from_millis(50);

pub type LinkId = u32;

/// Credentials and endpoint for the CCS connection.
#[derive(Clone, Debug)]
pub struct CcsConfig {
    pub server_id: String,
    pub server_key: String,
    pub host: String,
    pub port: u16,
}

/// Everything a link reports back to its owner.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Started(LinkId),
    Established(LinkId),
    HandshakeStarted(LinkId),
    SessionEstablished(LinkId),
    Heartbeat(LinkId),
    StreamClosed(LinkId),
    ConnectionLost(LinkId),
    DrainingStarted(LinkId),
    DrainingCompleted(LinkId),
    LinkError(LinkId, String),
    Upstream(LinkId, Value),
    Ack(LinkId, Value),
    Nack(LinkId, Value),
    Receipt(LinkId, Value),
}

#[derive(Debug)]
pub enum LinkCommand {
    Send(Value),
    Shutdown,
}

/// Cheap addressed sender for one link task.
#[derive(Clone)]
pub struct LinkHandle {
    id: LinkId,
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    pub fn from_parts(id: LinkId, cmd_tx: mpsc::Sender<LinkCommand>) -> Self {
        Self { id, cmd_tx }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queue a JSON document for sending. Returns false if the link task
    /// is gone.
    pub async fn send(&self, payload: Value) -> bool {
        self.cmd_tx.send(LinkCommand::Send(payload)).await.is_ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(LinkCommand::Shutdown).await;
    }
}

pub struct FcmLink;

impl FcmLink {
    pub fn spawn(id: LinkId, config: CcsConfig, events: mpsc::Sender<LinkEvent>) -> LinkHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(run(id, config, events, cmd_rx));
        LinkHandle { id, cmd_tx }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Lost,
    DrainingClosed,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitFeatures,
    AwaitSaslResult,
    AwaitRestartFeatures,
    AwaitBindResult,
    Ready,
}

async fn run(
    id: LinkId,
    config: CcsConfig,
    events: mpsc::Sender<LinkEvent>,
    mut commands: mpsc::Receiver<LinkCommand>,
) {
    let mut backoff = Backoff::unbounded();
    loop {
        let _ = events.send(LinkEvent::Started(id)).await;
        let stream = match connect_tls(&config).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = events
                    .send(LinkEvent::LinkError(id, e.to_string()))
                    .await;
                let _ = events.send(LinkEvent::ConnectionLost(id)).await;
                if !reconnect_delay(id, &mut backoff, &mut commands).await {
                    return;
                }
                continue;
            }
        };
        let _ = events.send(LinkEvent::Established(id)).await;

        match drive(id, &config, stream, &events, &mut commands, &mut backoff).await {
            Exit::Lost => {
                let _ = events.send(LinkEvent::ConnectionLost(id)).await;
                if !reconnect_delay(id, &mut backoff, &mut commands).await {
                    return;
                }
            }
            Exit::DrainingClosed => {
                let _ = events.send(LinkEvent::DrainingCompleted(id)).await;
                return;
            }
            Exit::Shutdown => return,
        }
    }
}

/// Sleep out one backoff period while still honouring shutdown. Returns
/// false when the link should stop instead of reconnecting.
async fn reconnect_delay(
    id: LinkId,
    backoff: &mut Backoff,
    commands: &mut mpsc::Receiver<LinkCommand>,
) -> bool {
    let delay = backoff.next().unwrap_or(Duration::from_secs(1));
    debug!(link = id, ?delay, "reconnecting to FCM after backoff");
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                Some(LinkCommand::Shutdown) | None => return false,
                Some(LinkCommand::Send(_)) => {
                    warn!(link = id, "dropping outbound message, link is down");
                }
            }
        }
    }
}

async fn drive<T>(
    id: LinkId,
    config: &CcsConfig,
    stream: T,
    events: &mpsc::Sender<LinkEvent>,
    commands: &mut mpsc::Receiver<LinkCommand>,
    backoff: &mut Backoff,
) -> Exit
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = StanzaStream::new(stream);
    let mut phase = Phase::AwaitFeatures;
    let mut draining = false;

    let _ = events.send(LinkEvent::HandshakeStarted(id)).await;
    if let Err(e) = stream.write_all(stream_header().as_bytes()).await {
        let _ = events.send(LinkEvent::LinkError(id, e.to_string())).await;
        return Exit::Lost;
    }

    loop {
        tokio::select! {
            item = stream.next() => match item {
                None => {
                    return if draining { Exit::DrainingClosed } else { Exit::Lost };
                }
                Some(Err(e)) => {
                    let _ = events.send(LinkEvent::LinkError(id, e.to_string())).await;
                    return if draining { Exit::DrainingClosed } else { Exit::Lost };
                }
                Some(Ok(WireItem::Heartbeat)) => {
                    let _ = events.send(LinkEvent::Heartbeat(id)).await;
                }
                Some(Ok(WireItem::StreamHeader)) => {
                    trace!(link = id, "received stream header");
                }
                Some(Ok(WireItem::StreamEnd)) => {
                    let _ = events.send(LinkEvent::StreamClosed(id)).await;
                    let _ = stream.write_all(STREAM_END.as_bytes()).await;
                    return if draining { Exit::DrainingClosed } else { Exit::Lost };
                }
                Some(Ok(WireItem::Stanza(stanza))) => {
                    match handle_stanza(
                        id, config, &stanza, &mut stream, &mut phase, &mut draining, events, backoff,
                    )
                    .await
                    {
                        Ok(()) => {}
                        Err(e) => {
                            let _ = events.send(LinkEvent::LinkError(id, e.to_string())).await;
                            return if draining { Exit::DrainingClosed } else { Exit::Lost };
                        }
                    }
                }
            },
            cmd = commands.recv() => match cmd {
                None | Some(LinkCommand::Shutdown) => {
                    let _ = stream.write_all(STREAM_END.as_bytes()).await;
                    tokio::time::sleep(SHUTDOWN_LINGER).await;
                    return Exit::Shutdown;
                }
                Some(LinkCommand::Send(payload)) => {
                    if phase != Phase::Ready {
                        warn!(link = id, "link not authenticated yet, dropping outbound message");
                        continue;
                    }
                    if let Err(e) = stream.write_all(message_stanza(&payload).as_bytes()).await {
                        let _ = events.send(LinkEvent::LinkError(id, e.to_string())).await;
                        return if draining { Exit::DrainingClosed } else { Exit::Lost };
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_stanza<T>(
    id: LinkId,
    config: &CcsConfig,
    stanza: &Element,
    stream: &mut StanzaStream<T>,
    phase: &mut Phase,
    draining: &mut bool,
    events: &mpsc::Sender<LinkEvent>,
    backoff: &mut Backoff,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match stanza.local_name() {
        "features" => {
            if let Some(mechanisms) = stanza.child("mechanisms") {
                let offered: Vec<&str> = mechanisms
                    .children_named("mechanism")
                    .map(|m| m.text.as_str())
                    .collect();
                debug!(link = id, ?offered, "received sasl mechanisms");
                if !offered.contains(&"PLAIN") {
                    warn!(link = id, "server did not offer PLAIN, attempting it anyway");
                }
                stream
                    .write_all(auth_stanza(&config.server_id, &config.server_key).as_bytes())
                    .await?;
                *phase = Phase::AwaitSaslResult;
            } else if stanza.child("bind").is_some() {
                stream.write_all(bind_stanza().as_bytes()).await?;
                *phase = Phase::AwaitBindResult;
            } else {
                warn!(link = id, "features stanza with neither mechanisms nor bind");
            }
        }
        "success" => {
            // RFC 6120 4.3.3: restart the stream on the same connection,
            // without a closing tag.
            debug!(link = id, "sasl authentication succeeded, restarting stream");
            stream.write_all(stream_header().as_bytes()).await?;
            *phase = Phase::AwaitRestartFeatures;
        }
        "failure" => {
            let reason = stanza
                .children
                .first()
                .map(|c| c.local_name().to_string())
                .unwrap_or_else(|| "unknown".into());
            let _ = events
                .send(LinkEvent::LinkError(
                    id,
                    Error::AuthRejected(reason).to_string(),
                ))
                .await;
            // the server will close the stream; normal loss handling applies
        }
        "iq" => {
            if stanza.attr("type") == Some("result")
                && stanza
                    .child("bind")
                    .and_then(|b| b.child("jid"))
                    .is_some()
            {
                *phase = Phase::Ready;
                backoff.reset();
                let _ = events.send(LinkEvent::SessionEstablished(id)).await;
            } else {
                debug!(link = id, "ignoring iq stanza without bind result");
            }
        }
        "message" => {
            // bad content is reported but never kills the link
            let Some(gcm) = stanza.child("gcm") else {
                let _ = events
                    .send(LinkEvent::LinkError(
                        id,
                        "message stanza without gcm element".into(),
                    ))
                    .await;
                return Ok(());
            };
            match serde_json::from_str::<Value>(&gcm.text) {
                Ok(json) => dispatch_gcm(id, json, draining, events).await,
                Err(e) => {
                    let _ = events
                        .send(LinkEvent::LinkError(
                            id,
                            Error::Json(e).to_string(),
                        ))
                        .await;
                }
            }
        }
        other => {
            // report but do not kill the link
            let _ = events
                .send(LinkEvent::LinkError(
                    id,
                    format!("unknown stanza <{other}> received"),
                ))
                .await;
        }
    }
    Ok(())
}

async fn dispatch_gcm(
    id: LinkId,
    json: Value,
    draining: &mut bool,
    events: &mpsc::Sender<LinkEvent>,
) {
    match json.get("message_type").and_then(Value::as_str) {
        None => {
            let _ = events.send(LinkEvent::Upstream(id, json)).await;
        }
        Some("ack") => {
            let _ = events.send(LinkEvent::Ack(id, json)).await;
        }
        Some("nack") => {
            let _ = events.send(LinkEvent::Nack(id, json)).await;
        }
        Some("receipt") => {
            let _ = events.send(LinkEvent::Receipt(id, json)).await;
        }
        Some("control") => {
            match json.get("control_type").and_then(Value::as_str) {
                Some("CONNECTION_DRAINING") => {
                    *draining = true;
                    let _ = events.send(LinkEvent::DrainingStarted(id)).await;
                }
                other => {
                    let _ = events
                        .send(LinkEvent::LinkError(
                            id,
                            format!("unknown control message {other:?}"),
                        ))
                        .await;
                }
            }
        }
        Some(other) => {
            let _ = events
                .send(LinkEvent::LinkError(
                    id,
                    format!("unknown message_type {other:?}"),
                ))
                .await;
        }
    }
}

fn new_tls_initiator() -> tokio_rustls::TlsConnector {
    let root_store = tokio_rustls::rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_rustls::TlsConnector::from(std::sync::Arc::new(config))
}

async fn connect_tls(
    config: &CcsConfig,
) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>, Error> {
    // Install the default crypto provider if not already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let domain = ServerName::try_from(config.host.clone())
        .map_err(|_| Error::Tls("invalid server name"))?;

    let stream = tokio::net::TcpStream::connect((config.host.as_str(), config.port)).await?;
    let tls = new_tls_initiator();
    let stream = tls.connect(domain, stream).await?;
    Ok(stream)
}
