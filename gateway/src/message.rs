//! The canonical message record and its vocabulary.
//!
//! Every payload crossing the gateway is persisted as one of these, keyed
//! by a process-wide monotonic sequence id. The sequence id doubles as
//! the BAL-facing handle used in ACK frames.

use ccs_link::Backoff;
use serde_json::Value;

/// Flow-control cap: unacked messages per peer.
pub const MAX_PENDING_MESSAGES: usize = 100;
pub const MAX_DOWNSTREAM_UPLOAD_RETRY: u32 = 10;
pub const MAX_UPSTREAM_UPLOAD_RETRY: u32 = 10;

/// Session id reserved for the FCM endpoint.
pub const FCM_SESSION_ID: &str = "fcm";

/// Field names inside the FCM JSON travelling in a gcm stanza.
pub mod fcm_fields {
    pub const MESSAGE_TYPE: &str = "message_type";
    pub const MESSAGE_ID: &str = "message_id";
    pub const ERROR: &str = "error";
    pub const ERROR_DESC: &str = "error_description";
    pub const FROM: &str = "from";
    pub const CATEGORY: &str = "category";
    pub const TO: &str = "to";
}

/// Field names in the gateway envelope exchanged with BAL clients.
pub mod envelope_fields {
    pub const MESSAGE_TYPE: &str = "message_type";
    pub const SEQUENCE_ID: &str = "sequence_id";
    pub const SESSION_ID: &str = "session_id";
    pub const ERROR_DESC: &str = "error_description";
    pub const FCM_DATA: &str = "fcm_data";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Logon = 1,
    LogonResponse = 2,
    Ack = 3,
    Upstream = 4,
    Downstream = 5,
    DownstreamAck = 6,
    DownstreamReceipt = 7,
    DownstreamReject = 8,
}

impl MessageKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Logon),
            2 => Some(Self::LogonResponse),
            3 => Some(Self::Ack),
            4 => Some(Self::Upstream),
            5 => Some(Self::Downstream),
            6 => Some(Self::DownstreamAck),
            7 => Some(Self::DownstreamReceipt),
            8 => Some(Self::DownstreamReject),
            _ => None,
        }
    }

    /// The `message_type` string used on the BAL wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Logon => "LOGON",
            Self::LogonResponse => "LOGON_RESPONSE",
            Self::Ack => "ACK",
            Self::Upstream => "UPSTREAM",
            Self::Downstream => "DOWNSTREAM",
            Self::DownstreamAck => "DOWNSTREAM_ACK",
            Self::DownstreamReceipt => "DOWNSTREAM_RECEIPT",
            Self::DownstreamReject => "DOWNSTREAM_REJECT",
        }
    }

    /// Kinds the gateway delivers to a BAL session.
    pub fn is_bal_bound(self) -> bool {
        matches!(
            self,
            Self::Upstream | Self::DownstreamAck | Self::DownstreamReceipt | Self::DownstreamReject
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    New = 1,
    PendingAck = 2,
    Delivered = 3,
    DeliveryFailed = 4,
}

impl MessageState {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::New),
            2 => Some(Self::PendingAck),
            3 => Some(Self::Delivered),
            4 => Some(Self::DeliveryFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub sequence_id: i64,
    pub kind: MessageKind,
    pub fcm_message_id: String,
    /// FIFO key; empty string means no ordering group.
    pub group_id: String,
    pub source_session_id: String,
    pub target_session_id: String,
    pub state: MessageState,
    /// The exact wire document to emit.
    pub payload: Value,
    pub entered_at: String,
    pub last_update_at: String,
    /// Retry bookkeeping, never persisted.
    pub retry: Backoff,
    pub retry_scheduled: bool,
}

impl Message {
    pub fn new(
        sequence_id: i64,
        kind: MessageKind,
        fcm_message_id: impl Into<String>,
        group_id: impl Into<String>,
        source_session_id: impl Into<String>,
        target_session_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            sequence_id,
            kind,
            fcm_message_id: fcm_message_id.into(),
            group_id: group_id.into(),
            source_session_id: source_session_id.into(),
            target_session_id: target_session_id.into(),
            state: MessageState::New,
            payload,
            entered_at: String::new(),
            last_update_at: String::new(),
            retry: retry_budget(kind),
            retry_scheduled: false,
        }
    }

    /// Row loaded back from the store.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        sequence_id: i64,
        kind: MessageKind,
        fcm_message_id: String,
        group_id: String,
        source_session_id: String,
        target_session_id: String,
        state: MessageState,
        payload: Value,
        entered_at: String,
        last_update_at: String,
    ) -> Self {
        Self {
            sequence_id,
            kind,
            fcm_message_id,
            group_id,
            source_session_id,
            target_session_id,
            state,
            payload,
            entered_at,
            last_update_at,
            retry: retry_budget(kind),
            retry_scheduled: false,
        }
    }

    /// Log handle: sequence id plus the FCM message id when present.
    pub fn identifier(&self) -> String {
        if self.fcm_message_id.is_empty() {
            format!("seq:{}", self.sequence_id)
        } else {
            format!("seq:{}/fcm:{}", self.sequence_id, self.fcm_message_id)
        }
    }
}

/// FCM-bound messages and BAL-bound relays carry separate retry budgets.
fn retry_budget(kind: MessageKind) -> Backoff {
    if kind.is_bal_bound() {
        Backoff::new(MAX_UPSTREAM_UPLOAD_RETRY)
    } else {
        Backoff::new(MAX_DOWNSTREAM_UPLOAD_RETRY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_message_starts_new() {
        let msg = Message::new(
            1,
            MessageKind::Downstream,
            "m1",
            "g1",
            "balA",
            FCM_SESSION_ID,
            json!({"to": "d1"}),
        );
        assert_eq!(msg.state, MessageState::New);
        assert_eq!(msg.sequence_id, 1);
        assert_eq!(msg.group_id, "g1");
        assert!(!msg.retry_scheduled);
        assert_eq!(msg.identifier(), "seq:1/fcm:m1");
    }

    #[test]
    fn kind_codes_round_trip() {
        for kind in [
            MessageKind::Logon,
            MessageKind::LogonResponse,
            MessageKind::Ack,
            MessageKind::Upstream,
            MessageKind::Downstream,
            MessageKind::DownstreamAck,
            MessageKind::DownstreamReceipt,
            MessageKind::DownstreamReject,
        ] {
            assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MessageKind::from_code(99), None);
    }

    #[test]
    fn state_codes_round_trip() {
        for state in [
            MessageState::New,
            MessageState::PendingAck,
            MessageState::Delivered,
            MessageState::DeliveryFailed,
        ] {
            assert_eq!(MessageState::from_code(state.code()), Some(state));
        }
        assert_eq!(MessageState::from_code(0), None);
    }

    #[test]
    fn bal_bound_kinds() {
        assert!(MessageKind::Upstream.is_bal_bound());
        assert!(MessageKind::DownstreamReject.is_bal_bound());
        assert!(!MessageKind::Downstream.is_bal_bound());
        assert!(!MessageKind::Logon.is_bal_bound());
    }
}
