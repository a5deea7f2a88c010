//! ccs-gateway - push-notification gateway between FCM CCS and BAL clients
//!
//! This server:
//! 1. Holds one long-lived XMPP session with FCM CCS (plus a draining
//!    predecessor during load-balancing handovers)
//! 2. Accepts BAL clients over TCP and authenticates them by session id
//! 3. Relays messages in both directions under FCM's flow-control rules,
//!    persisting every message so delivery resumes after a restart

mod bal;
mod config;
mod core;
mod event;
mod manager;
mod message;
mod store;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::GatewayConfig;
use crate::core::Core;
use crate::event::Event;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ccs_gateway=info".parse()?),
        )
        .init();

    info!("Reading config file...");
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load(&config_path)?;
    log_properties(&config);

    let store = Store::open(&config.db_path).await?;
    info!(
        "Sequence id initialized to {}",
        store.last_sequence_id()
    );

    let (events_tx, events_rx) = mpsc::channel(1024);

    // SIGINT/SIGTERM turn into an ordinary shutdown event
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let signal_events = events_tx.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        let _ = signal_events.send(Event::Shutdown).await;
    });

    let listener =
        tokio::net::TcpListener::bind((config.listen_host.as_str(), config.listen_port))
            .await
            .with_context(|| {
                format!(
                    "Unable to listen at {}:{}",
                    config.listen_host, config.listen_port
                )
            })?;
    info!(
        "Listening at {}:{} for BAL connections...",
        config.listen_host, config.listen_port
    );
    let accept_loop = bal::spawn_accept_loop(listener, events_tx.clone());

    let mut core = Core::new(config, store, events_tx);
    core.load_pending().await?;
    core.connect_fcm();

    core.run(events_rx).await;

    accept_loop.abort();
    info!("Gateway stopped. GOODBYE!");
    Ok(())
}

fn log_properties(config: &GatewayConfig) {
    info!("FCM_SECTION/server_id: {}", config.fcm.server_id);
    info!("FCM_SECTION/server_key: ****");
    info!("FCM_SECTION/host_address: {}", config.fcm.host);
    info!("FCM_SECTION/port_no: {}", config.fcm.port);
    info!("SERVER_SECTION/host_address: {}", config.listen_host);
    info!("SERVER_SECTION/port_no: {}", config.listen_port);
    info!("BAL_SECTION/session_id: {}", config.bal_session_id);
    info!("Database path: {}", config.db_path);
}
