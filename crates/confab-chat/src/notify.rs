//! Fire-and-forget notification hand-off.
//!
//! Sinks are called after the send transaction commits. They must not
//! block and must not fail: delivery problems are logged here and never
//! reach the sender.

use confab_shared::{ConversationRef, MessageId, UserId};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub conversation: ConversationRef,
    pub message_id: MessageId,
    pub preview: String,
}

/// A payload addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: UserId,
    pub payload: NotificationPayload,
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, recipient: UserId, payload: NotificationPayload);
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl NotificationSink for NoopNotifier {
    fn notify(&self, _recipient: UserId, _payload: NotificationPayload) {}
}

/// Forwards notifications to a bounded tokio channel drained by the host's
/// push dispatcher. A full or closed channel drops the notification.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelNotifier {
    fn notify(&self, recipient: UserId, payload: NotificationPayload) {
        let message_id = payload.message_id;
        if let Err(e) = self.tx.try_send(Notification { recipient, payload }) {
            tracing::warn!(
                recipient = %recipient,
                message_id = %message_id,
                error = %e,
                "notification dropped"
            );
        }
    }
}
