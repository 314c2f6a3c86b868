//! Durable operation store and its change notifications.
//!
//! The queue only talks to storage through [`OperationStore`]. The SQLite
//! implementation is the one shipped; tests wrap it to inject failures.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{NewOperation, Operation, Transition};

pub mod error;
pub mod migrations;
pub mod sqlite;

pub use error::{StoreError, SubscriptionError};
pub use sqlite::{default_database_path, ChangeWatcher, Database, SqliteStore};

/// Kind of mutation behind a change notification.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Another connection committed; the affected rows are unknown.
    External,
}

/// A notification that the operations table changed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreChange {
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StoreChange {
    pub fn new(kind: ChangeKind, id: &str) -> Self {
        Self {
            kind,
            id: Some(id.to_string()),
        }
    }

    pub fn external() -> Self {
        Self {
            kind: ChangeKind::External,
            id: None,
        }
    }
}

/// The storage surface the queue consumes.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Inserts a new pending operation and returns the stored record.
    async fn insert(&self, new: NewOperation) -> Result<Operation, StoreError>;

    /// The pending operation with the smallest `created_at`, if any.
    async fn oldest_pending(&self) -> Result<Option<Operation>, StoreError>;

    /// Every operation, oldest first.
    async fn list_all(&self) -> Result<Vec<Operation>, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Operation>, StoreError>;

    /// Persists a status transition for the given operation.
    async fn apply(&self, id: &str, transition: &Transition) -> Result<(), StoreError>;

    /// Subscribes to change notifications for the operations table.
    async fn subscribe(&self) -> Result<Subscription, StoreError>;
}

/// Fan-out of store change notifications.
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<StoreChange>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, change: StoreChange) {
        // Ignore errors - no active subscribers is fine
        let _ = self.sender.send(change);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.sender.subscribe())
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live change subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: broadcast::Receiver<StoreChange>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<StoreChange>) -> Self {
        Self { receiver }
    }

    /// Waits for the next change.
    pub async fn recv(&mut self) -> Result<StoreChange, SubscriptionError> {
        match self.receiver.recv().await {
            Ok(change) => Ok(change),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }
}
