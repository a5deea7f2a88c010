//! The gateway's single input channel.
//!
//! Every producer (FCM links, BAL readers, timers, the signal task)
//! pushes typed events here; the core consumes them one at a time, so
//! all state mutation is serialized.

use crate::bal::BalFrame;
use ccs_link::LinkEvent;
use std::net::SocketAddr;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;

pub enum Event {
    Link(LinkEvent),
    BalConnected {
        conn_id: u64,
        peer: SocketAddr,
        writer: OwnedWriteHalf,
        stop_tx: mpsc::Sender<()>,
    },
    BalFrame {
        conn_id: u64,
        frame: BalFrame,
    },
    BalDisconnected {
        conn_id: u64,
    },
    BalAuthTimeout {
        conn_id: u64,
    },
    /// A nacked downstream message's backoff fired.
    RetryDownstream {
        sequence_id: i64,
    },
    /// A deferred BAL-bound resend fired.
    RetryToBal {
        session_id: String,
        sequence_id: i64,
    },
    /// The post-LOGON kick that replays pending messages.
    ResendPendingToBal {
        session_id: String,
    },
    Shutdown,
}
