//! Drives one claimed operation from `pending` to a terminal status.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use futures_util::FutureExt;
use log::{error, info, warn};
use tokio::sync::OwnedSemaphorePermit;
use tracing::Instrument;

use crate::backend::{ExecutionBackend, ExecutionError};
use crate::error::QueueError;
use crate::model::{Operation, OperationStatus, Transition};
use crate::notify::{Notification, Notifier};
use crate::store::{OperationStore, StoreError};

/// In-memory final state of an executed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub id: String,
    pub status: OperationStatus,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl From<&Operation> for ExecutionReport {
    fn from(op: &Operation) -> Self {
        Self {
            id: op.id.clone(),
            status: op.status,
            result: op.result.clone(),
            error_message: op.error_message.clone(),
            executed_at: op.executed_at,
        }
    }
}

pub struct Executor {
    store: Arc<dyn OperationStore>,
    backend: Arc<dyn ExecutionBackend>,
    notifier: Notifier,
    timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn OperationStore>,
        backend: Arc<dyn ExecutionBackend>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            notifier,
            timeout,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Runs `op` to completion while holding the single-flight `permit`.
    ///
    /// The permit is released when this returns or unwinds. Returns `None`
    /// when the operation was already claimed elsewhere and nothing ran.
    pub async fn run(
        &self,
        op: Operation,
        permit: OwnedSemaphorePermit,
    ) -> Option<ExecutionReport> {
        let span = tracing::info_span!(
            "executor.run",
            operation_id = %op.id,
            sim_slot = op.sim_slot,
            backend = self.backend.name()
        );
        let report = self.drive(op).instrument(span).await;
        drop(permit);
        report
    }

    async fn drive(&self, mut op: Operation) -> Option<ExecutionReport> {
        // Stored with microsecond precision; keep the in-memory record equal.
        let executing = Transition::Executing {
            executed_at: Utc::now().trunc_subsecs(6),
        };
        match self.store.apply(&op.id, &executing).await {
            Ok(()) => {}
            Err(StoreError::StaleTransition { current, .. }) => {
                warn!(
                    "Operation {} is already {}, leaving it to its owner",
                    op.id,
                    current.as_str()
                );
                return None;
            }
            Err(e) => {
                let err = QueueError::StoreWrite {
                    id: op.id.clone(),
                    status: OperationStatus::Executing.as_str(),
                    source: e,
                };
                warn!("{}; executing anyway", err);
            }
        }
        op.apply(&executing);

        info!(
            "Executing USSD {} on SIM {} (operation {})",
            op.ussd_code, op.sim_slot, op.id
        );
        self.notifier.send(Notification::started(&op));

        let transition = match self.call_backend(&op).await {
            Ok(response) => Transition::Completed { result: response },
            Err(e) => {
                let error_message = e.to_string();
                error!(
                    "{}",
                    QueueError::Execution {
                        id: op.id.clone(),
                        source: e,
                    }
                );
                Transition::Failed { error_message }
            }
        };

        if let Err(e) = self.store.apply(&op.id, &transition).await {
            error!(
                "{}",
                QueueError::StoreWrite {
                    id: op.id.clone(),
                    status: transition.status().as_str(),
                    source: e,
                }
            );
        }
        op.apply(&transition);

        match &transition {
            Transition::Completed { .. } => {
                info!("USSD {} completed (operation {})", op.ussd_code, op.id);
                self.notifier.send(Notification::success(&op));
            }
            Transition::Failed { error_message } => {
                self.notifier
                    .send(Notification::failure(&op, error_message));
            }
            Transition::Executing { .. } => {}
        }

        Some(ExecutionReport::from(&op))
    }

    /// Calls the backend with a deadline; a panicking backend counts as a failure.
    async fn call_backend(&self, op: &Operation) -> Result<String, ExecutionError> {
        let call = self.backend.execute(&op.ussd_code, op.sim_slot);
        match tokio::time::timeout(self.timeout, AssertUnwindSafe(call).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutionError::Failed(format!(
                "{} backend panicked",
                self.backend.name()
            ))),
            Err(_) => Err(ExecutionError::TimedOut(self.timeout)),
        }
    }
}
