//! Live, read-only view of the whole queue.
//!
//! The observer never writes. It re-reads every operation whenever the store
//! reports a change and replaces the view wholesale; volumes are small enough
//! that incremental patching is not worth it.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::ObserverConfig;
use crate::error::QueueError;
use crate::model::Operation;
use crate::store::{OperationStore, Subscription, SubscriptionError};

pub struct QueueObserver {
    store: Arc<dyn OperationStore>,
    resubscribe_initial: Duration,
    resubscribe_max: Duration,
}

impl QueueObserver {
    pub fn new(store: Arc<dyn OperationStore>) -> Self {
        Self::with_config(store, &ObserverConfig::default())
    }

    pub fn with_config(store: Arc<dyn OperationStore>, config: &ObserverConfig) -> Self {
        Self {
            store,
            resubscribe_initial: Duration::from_millis(config.resubscribe_initial_ms),
            resubscribe_max: Duration::from_millis(config.resubscribe_max_ms),
        }
    }

    /// Subscribes, seeds the view with a full read and starts following changes.
    ///
    /// The view is seeded by the time this returns (or left empty if the
    /// seeding read failed).
    pub async fn start(self) -> ObserverHandle {
        let subscription = match self.store.subscribe().await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!("{}", QueueError::Subscription(e.to_string()));
                None
            }
        };

        let (view_tx, view_rx) = watch::channel(Vec::new());
        refresh(self.store.as_ref(), &view_tx).await;
        info!(
            "Queue observer started with {} operation(s)",
            view_tx.borrow().len()
        );

        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            self.follow(subscription, view_tx, &stop_signal).await;
            info!("Queue observer stopped");
        });

        ObserverHandle {
            view: view_rx,
            stop,
            task: Some(task),
        }
    }

    async fn follow(
        &self,
        mut subscription: Option<Subscription>,
        view: watch::Sender<Vec<Operation>>,
        stop: &Notify,
    ) {
        let mut backoff = self.resubscribe_initial;

        loop {
            let Some(sub) = subscription.as_mut() else {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                match self.store.subscribe().await {
                    Ok(sub) => {
                        info!("Change subscription re-established");
                        subscription = Some(sub);
                        backoff = self.resubscribe_initial;
                        // Changes may have been missed while unsubscribed.
                        refresh(self.store.as_ref(), &view).await;
                    }
                    Err(e) => {
                        warn!("{}", QueueError::Subscription(e.to_string()));
                        backoff = (backoff * 2).min(self.resubscribe_max);
                    }
                }
                continue;
            };

            let event = tokio::select! {
                _ = stop.notified() => break,
                event = sub.recv() => event,
            };

            match event {
                Ok(change) => {
                    debug!("Store changed ({:?}), refreshing view", change.kind);
                    refresh(self.store.as_ref(), &view).await;
                }
                Err(SubscriptionError::Lagged(missed)) => {
                    debug!("Missed {} change notifications, refreshing view", missed);
                    refresh(self.store.as_ref(), &view).await;
                }
                Err(SubscriptionError::Closed) => {
                    warn!(
                        "{}; retrying in {:?}",
                        QueueError::Subscription(SubscriptionError::Closed.to_string()),
                        backoff
                    );
                    subscription = None;
                }
            }
        }
        // `subscription` drops here, on every exit path.
    }
}

/// Re-reads every operation; keeps the previous view if the read fails.
async fn refresh(store: &dyn OperationStore, view: &watch::Sender<Vec<Operation>>) {
    match store.list_all().await {
        Ok(operations) => {
            view.send_if_modified(|current| {
                if *current == operations {
                    false
                } else {
                    *current = operations;
                    true
                }
            });
        }
        Err(e) => warn!("{}", QueueError::StoreRead(e)),
    }
}

/// A running observer. Stops on [`ObserverHandle::stop`] or drop.
pub struct ObserverHandle {
    view: watch::Receiver<Vec<Operation>>,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl ObserverHandle {
    /// A receiver for the live view.
    pub fn view(&self) -> watch::Receiver<Vec<Operation>> {
        self.view.clone()
    }

    /// The current view.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.view.borrow().clone()
    }

    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Queue observer task failed: {}", e);
            }
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}
