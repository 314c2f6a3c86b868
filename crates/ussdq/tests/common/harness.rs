//! Test harness for queue integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use ussdq::model::{NewOperation, Operation, OperationStatus, Transition};
use ussdq::store::{
    ChangeFeed, ChangeKind, OperationStore, SqliteStore, StoreChange, StoreError, Subscription,
};
use ussdq::{ExecutionBackend, ExecutionError, Executor, Notifier, QueuePoller};

/// Backend with per-code replies that records every call.
pub struct ScriptedBackend {
    replies: Mutex<HashMap<String, Result<String, String>>>,
    calls: Mutex<Vec<(String, u32)>>,
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    /// Replies `ok:<code>` to everything.
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Each call waits for one permit from the returned gate before replying.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let backend = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (backend, gate)
    }

    pub fn reply(self, code: &str, response: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(code.to_string(), Ok(response.to_string()));
        self
    }

    pub fn fail(self, code: &str, error: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(code.to_string(), Err(error.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn execute(&self, code: &str, sim_slot: u32) -> Result<String, ExecutionError> {
        self.calls.lock().unwrap().push((code.to_string(), sim_slot));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().get(code).cloned();
        match reply {
            Some(Ok(response)) => Ok(response),
            Some(Err(error)) => Err(ExecutionError::Failed(error)),
            None => Ok(format!("ok:{}", code)),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Wraps a [`SqliteStore`] and fails reads, writes or subscriptions on request.
///
/// Changes are published on a feed of its own, synchronously from `insert`
/// and `apply`, so tests can drop every live subscription with
/// [`FlakyStore::close_subscriptions`].
pub struct FlakyStore {
    inner: SqliteStore,
    failing_reads: AtomicUsize,
    failing_subscribes: AtomicUsize,
    failing_writes: Mutex<HashMap<OperationStatus, usize>>,
    reads: AtomicUsize,
    subscribes: AtomicUsize,
    feed: Mutex<ChangeFeed>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            failing_reads: AtomicUsize::new(0),
            failing_subscribes: AtomicUsize::new(0),
            failing_writes: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            subscribes: AtomicUsize::new(0),
            feed: Mutex::new(ChangeFeed::new(64)),
        }
    }

    /// The next `n` reads (`oldest_pending`, `list_all`) fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// The next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// The next `n` transitions to `status` fail without touching the row.
    pub fn fail_next_writes(&self, status: OperationStatus, n: usize) {
        self.failing_writes.lock().unwrap().insert(status, n);
    }

    /// Closes every live subscription; later subscribes get a fresh feed.
    pub fn close_subscriptions(&self) {
        *self.feed.lock().unwrap() = ChangeFeed::new(64);
    }

    /// Publishes a change without touching the data.
    pub fn notify(&self, change: StoreChange) {
        self.feed.lock().unwrap().publish(change);
    }

    /// Number of read attempts, failed ones included.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &SqliteStore {
        &self.inner
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<(), StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        Ok(())
    }

    fn write(&self, status: OperationStatus) -> Result<(), StoreError> {
        let mut failing = self.failing_writes.lock().unwrap();
        match failing.get_mut(&status) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(StoreError::Unavailable(format!(
                    "injected {} write failure",
                    status.as_str()
                )))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl OperationStore for FlakyStore {
    async fn insert(&self, new: NewOperation) -> Result<Operation, StoreError> {
        let op = self.inner.insert(new).await?;
        self.notify(StoreChange::new(ChangeKind::Insert, &op.id));
        Ok(op)
    }

    async fn oldest_pending(&self) -> Result<Option<Operation>, StoreError> {
        self.read()?;
        self.inner.oldest_pending().await
    }

    async fn list_all(&self) -> Result<Vec<Operation>, StoreError> {
        self.read()?;
        self.inner.list_all().await
    }

    async fn get(&self, id: &str) -> Result<Option<Operation>, StoreError> {
        self.inner.get(id).await
    }

    async fn apply(&self, id: &str, transition: &Transition) -> Result<(), StoreError> {
        self.write(transition.status())?;
        self.inner.apply(id, transition).await?;
        self.notify(StoreChange::new(ChangeKind::Update, id));
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_subscribes) {
            return Err(StoreError::Unavailable(
                "injected subscribe failure".to_string(),
            ));
        }
        Ok(self.feed.lock().unwrap().subscribe())
    }
}

/// A store, backend, executor and poller wired together.
pub struct TestQueue<S: OperationStore + 'static> {
    pub store: Arc<S>,
    pub backend: Arc<ScriptedBackend>,
    pub notifier: Notifier,
    pub poller: QueuePoller,
}

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

impl<S: OperationStore + 'static> TestQueue<S> {
    pub fn new(store: S, backend: ScriptedBackend) -> Self {
        let store = Arc::new(store);
        let backend = Arc::new(backend);
        let notifier = Notifier::new(64);
        let executor = Executor::new(
            store.clone(),
            backend.clone(),
            notifier.clone(),
            Duration::from_secs(45),
        );
        let poller = QueuePoller::new(store.clone(), executor, POLL_INTERVAL);
        Self {
            store,
            backend,
            notifier,
            poller,
        }
    }

    pub async fn enqueue(&self, code: &str, sim_slot: u32) -> Operation {
        self.store
            .insert(NewOperation::new(code, sim_slot).unwrap())
            .await
            .unwrap()
    }

    pub async fn get(&self, id: &str) -> Operation {
        self.store.get(id).await.unwrap().unwrap()
    }

    /// Polls the stored row until it reaches `status`.
    pub async fn wait_for_status(&self, id: &str, status: OperationStatus) -> Operation {
        for _ in 0..5000 {
            let op = self.get(id).await;
            if op.status == status {
                return op;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("operation {} never reached {}", id, status);
    }
}

impl TestQueue<SqliteStore> {
    pub fn in_memory(backend: ScriptedBackend) -> Self {
        Self::new(SqliteStore::open_in_memory().unwrap(), backend)
    }
}

/// Polls `cond` until it holds, letting spawned and blocking-pool work finish.
pub async fn settle<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
