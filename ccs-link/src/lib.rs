//! ccs-link - XMPP client for the FCM Cloud Connection Server
//!
//! This crate maintains a long-lived XMPP-over-TLS connection to FCM CCS
//! and turns the wire protocol into typed events: upstream device
//! messages, delivery acks/nacks, receipts, and the CONNECTION_DRAINING
//! control that asks the owner to fail over to a fresh connection.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ccs_link::{CcsConfig, FcmLink, LinkEvent};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CcsConfig {
//!         server_id: "123456789".into(),
//!         server_key: "AAAA...".into(),
//!         host: "fcm-xmpp.googleapis.com".into(),
//!         port: 5235,
//!     };
//!
//!     let (events_tx, mut events_rx) = mpsc::channel(256);
//!     let link = FcmLink::spawn(1, config, events_tx);
//!
//!     while let Some(event) = events_rx.recv().await {
//!         match event {
//!             LinkEvent::SessionEstablished(id) => {
//!                 println!("link {id} authenticated");
//!             }
//!             LinkEvent::Upstream(_, json) => {
//!                 println!("device message: {json}");
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     link.shutdown().await;
//! }
//! ```

mod backoff;
mod error;
mod link;
pub mod xmpp;

pub use backoff::Backoff;
pub use error::Error;
pub use link::{CcsConfig, FcmLink, LinkCommand, LinkEvent, LinkHandle, LinkId};
