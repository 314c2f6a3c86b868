//! User-facing notifications for execution transitions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::Operation;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Started,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub operation_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn started(op: &Operation) -> Self {
        Self::new(
            NotificationKind::Started,
            op,
            format!("Executing USSD: {} on SIM {}", op.ussd_code, op.sim_slot),
        )
    }

    pub fn success(op: &Operation) -> Self {
        Self::new(
            NotificationKind::Success,
            op,
            format!("USSD completed: {}", op.ussd_code),
        )
    }

    pub fn failure(op: &Operation, error: &str) -> Self {
        Self::new(
            NotificationKind::Failure,
            op,
            format!("USSD failed: {}: {}", op.ussd_code, error),
        )
    }

    fn new(kind: NotificationKind, op: &Operation, text: String) -> Self {
        Self {
            kind,
            operation_id: op.id.clone(),
            text,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget fan-out of notifications.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn send(&self, notification: Notification) {
        // Ignore errors - no active receivers is fine
        let _ = self.sender.send(notification);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
