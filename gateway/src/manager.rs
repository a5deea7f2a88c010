//! Per-endpoint message tracking and flow control.
//!
//! One [`MessageManager`] exists for the FCM endpoint and one per BAL
//! session. It owns the messages (keyed by sequence id), keeps the group
//! and fcm-message-id indexes as plain id sets, and arbitrates sending:
//! the pending-ack window and the at-most-one-in-flight-per-group rule.

use crate::message::{Message, MessageState};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    WrongState,
    PendingFull,
    GroupBlocked,
}

/// FIFO ordering queue for one group id: only the oldest member may be
/// in flight.
#[derive(Debug, Default)]
struct Group {
    queue: BTreeSet<i64>,
}

impl Group {
    fn add(&mut self, sequence_id: i64) {
        self.queue.insert(sequence_id);
    }

    fn remove(&mut self, sequence_id: i64) {
        self.queue.remove(&sequence_id);
    }

    fn can_send(&self, sequence_id: i64) -> bool {
        self.queue.first() == Some(&sequence_id)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug)]
pub struct MessageManager {
    session_id: String,
    max_pending: usize,
    pending_ack: usize,
    /// Main queue, ordered by sequence id.
    messages: BTreeMap<i64, Message>,
    groups: HashMap<String, Group>,
    /// fcm_message_id -> sequence_id, for acks/nacks keyed by FCM's id.
    by_fcm_id: HashMap<String, i64>,
}

impl MessageManager {
    pub fn new(session_id: impl Into<String>, max_pending: usize) -> Self {
        Self {
            session_id: session_id.into(),
            max_pending,
            pending_ack: 0,
            messages: BTreeMap::new(),
            groups: HashMap::new(),
            by_fcm_id: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_ack
    }

    pub fn add(&mut self, msg: Message) {
        if !msg.fcm_message_id.is_empty() {
            let previous = self
                .by_fcm_id
                .insert(msg.fcm_message_id.clone(), msg.sequence_id);
            if let Some(previous) = previous {
                warn!(
                    session = %self.session_id,
                    fcm_message_id = %msg.fcm_message_id,
                    previous,
                    "fcm message id already tracked, index now points at the newer message"
                );
            }
        }
        if !msg.group_id.is_empty() {
            self.groups
                .entry(msg.group_id.clone())
                .or_default()
                .add(msg.sequence_id);
        }
        if msg.state == MessageState::PendingAck {
            self.pending_ack += 1;
        }
        self.messages.insert(msg.sequence_id, msg);
    }

    /// Remove from the main queue and every index. Decrements the pending
    /// counter iff the removed message was awaiting an ack.
    pub fn remove(&mut self, sequence_id: i64) -> Option<Message> {
        let msg = self.messages.remove(&sequence_id)?;
        if !msg.fcm_message_id.is_empty() {
            // only drop the index entry if it still points at us
            if self.by_fcm_id.get(&msg.fcm_message_id) == Some(&sequence_id) {
                self.by_fcm_id.remove(&msg.fcm_message_id);
            }
        }
        if !msg.group_id.is_empty() {
            if let Some(group) = self.groups.get_mut(&msg.group_id) {
                group.remove(sequence_id);
                if group.is_empty() {
                    self.groups.remove(&msg.group_id);
                }
            }
        }
        if msg.state == MessageState::PendingAck {
            self.pending_ack = self.pending_ack.saturating_sub(1);
        }
        Some(msg)
    }

    pub fn get(&self, sequence_id: i64) -> Option<&Message> {
        self.messages.get(&sequence_id)
    }

    pub fn get_mut(&mut self, sequence_id: i64) -> Option<&mut Message> {
        self.messages.get_mut(&sequence_id)
    }

    pub fn find_by_fcm_id(&self, fcm_message_id: &str) -> Option<i64> {
        self.by_fcm_id.get(fcm_message_id).copied()
    }

    /// Sequence ids in send order; collected so callers may mutate while
    /// walking.
    pub fn sequence_ids(&self) -> Vec<i64> {
        self.messages.keys().copied().collect()
    }

    /// Admission check for a message still in the NEW state.
    pub fn can_send_new(&self, msg: &Message) -> Admission {
        if msg.state != MessageState::New {
            return Admission::WrongState;
        }
        self.check_window_and_group(msg)
    }

    /// Admission check after a reconnect: messages already awaiting an
    /// ack are retried as well.
    pub fn can_send_on_reconnect(&self, msg: &Message) -> Admission {
        if msg.state != MessageState::New && msg.state != MessageState::PendingAck {
            return Admission::WrongState;
        }
        self.check_window_and_group(msg)
    }

    fn check_window_and_group(&self, msg: &Message) -> Admission {
        if self.pending_ack >= self.max_pending {
            return Admission::PendingFull;
        }
        if !msg.group_id.is_empty() {
            let blocked = self
                .groups
                .get(&msg.group_id)
                .map(|g| !g.can_send(msg.sequence_id))
                .unwrap_or(false);
            if blocked {
                return Admission::GroupBlocked;
            }
        }
        Admission::Ok
    }

    /// Flip a tracked message to PENDING_ACK and count it against the
    /// window. The caller persists the state change first.
    pub fn mark_pending(&mut self, sequence_id: i64) {
        if let Some(msg) = self.messages.get_mut(&sequence_id) {
            if msg.state != MessageState::PendingAck {
                msg.state = MessageState::PendingAck;
                self.pending_ack += 1;
            }
        }
    }

    /// First message in sequence order that is admissible right now.
    pub fn next_sendable(&self) -> Option<i64> {
        self.messages
            .values()
            .find(|msg| self.can_send_new(msg) == Admission::Ok)
            .map(|msg| msg.sequence_id)
    }
}
