//! Timer-driven claim loop with a single-flight guard.
//!
//! Every tick is an independent attempt: take the guard, read the oldest
//! pending operation and hand it to the [`Executor`]. While an execution is
//! in flight, ticks still fire but do nothing.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::error::QueueError;
use crate::executor::{ExecutionReport, Executor};
use crate::store::{OperationStore, Subscription, SubscriptionError};

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// An execution was already in flight; the store was not touched.
    Busy,
    /// No pending operation.
    Idle,
    /// Reading the queue failed; the next tick retries.
    ReadFailed,
    /// The claimed operation had already moved on elsewhere.
    Skipped,
    /// The poller has been stopped.
    Stopped,
    Executed(ExecutionReport),
}

#[derive(Clone)]
pub struct QueuePoller {
    store: Arc<dyn OperationStore>,
    executor: Arc<Executor>,
    guard: Arc<Semaphore>,
    interval: Duration,
    dispatch_on_change: bool,
}

impl QueuePoller {
    pub fn new(store: Arc<dyn OperationStore>, executor: Executor, interval: Duration) -> Self {
        Self {
            store,
            executor: Arc::new(executor),
            guard: Arc::new(Semaphore::new(1)),
            interval,
            dispatch_on_change: false,
        }
    }

    /// Also tick as soon as the store reports a change.
    pub fn with_dispatch_on_change(mut self, enabled: bool) -> Self {
        self.dispatch_on_change = enabled;
        self
    }

    /// Whether an execution currently holds the guard.
    pub fn is_busy(&self) -> bool {
        self.guard.available_permits() == 0
    }

    /// One claim attempt.
    pub async fn tick(&self) -> TickOutcome {
        let permit = match self.guard.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                debug!("Execution in flight, skipping tick");
                return TickOutcome::Busy;
            }
            Err(TryAcquireError::Closed) => return TickOutcome::Stopped,
        };

        let op = match self.store.oldest_pending().await {
            Ok(Some(op)) => op,
            Ok(None) => return TickOutcome::Idle,
            Err(e) => {
                warn!("{}", QueueError::StoreRead(e));
                return TickOutcome::ReadFailed;
            }
        };

        match self.executor.run(op, permit).await {
            Some(report) => TickOutcome::Executed(report),
            None => TickOutcome::Skipped,
        }
    }

    /// Starts the tick loop in a background task.
    pub fn start(&self) -> PollerHandle {
        let poller = self.clone();
        let stop = Arc::new(Notify::new());
        let stop_signal = Arc::clone(&stop);

        let task = tokio::spawn(async move {
            info!(
                "Queue poller started (every {:?}, {} backend)",
                poller.interval,
                poller.executor.backend_name()
            );
            poller.run_loop(&stop_signal).await;
            info!("Queue poller stopped");
        });

        PollerHandle {
            stop,
            task: Some(task),
        }
    }

    async fn run_loop(&self, stop: &Notify) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // skip immediate first tick

        let mut changes = if self.dispatch_on_change {
            match self.store.subscribe().await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    warn!("{}", QueueError::Subscription(e.to_string()));
                    None
                }
            }
        } else {
            None
        };

        let mut ticks = JoinSet::new();

        loop {
            let wake = tokio::select! {
                _ = stop.notified() => Wake::Stop,
                _ = ticker.tick() => Wake::Tick,
                alive = next_change(&mut changes) => Wake::Change { alive },
                Some(_) = ticks.join_next(), if !ticks.is_empty() => Wake::Reaped,
            };

            match wake {
                Wake::Stop => break,
                Wake::Reaped => continue,
                Wake::Change { alive: false } => {
                    warn!("Change notifications closed, falling back to polling only");
                    changes = None;
                    continue;
                }
                Wake::Tick | Wake::Change { alive: true } => {}
            }

            let poller = self.clone();
            ticks.spawn(async move {
                let outcome = poller.tick().await;
                debug!("Tick finished: {:?}", outcome);
            });
        }

        // Wait for the in-flight execution, then refuse further claims so
        // ticks spawned but not yet polled return `Stopped`.
        if let Ok(permit) = self.guard.acquire().await {
            self.guard.close();
            drop(permit);
        }
        while ticks.join_next().await.is_some() {}
    }
}

enum Wake {
    Stop,
    Tick,
    Change { alive: bool },
    Reaped,
}

async fn next_change(changes: &mut Option<Subscription>) -> bool {
    match changes {
        Some(sub) => !matches!(sub.recv().await, Err(SubscriptionError::Closed)),
        None => std::future::pending().await,
    }
}

/// Stops the loop on [`PollerHandle::stop`] or drop.
pub struct PollerHandle {
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Stops ticking and waits for an in-flight execution to finish.
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Queue poller task failed: {}", e);
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop.notify_one();
    }
}
