//! Device execution backends.
//!
//! The executor only sees [`ExecutionBackend`]. Which implementation runs is
//! decided once at startup by [`select_backend`]: a GSM modem when one is
//! attached, otherwise the simulator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;

pub mod modem;
pub mod simulated;

pub use modem::ModemBackend;
pub use simulated::SimulatedBackend;

/// Failure reported by a backend.
///
/// The display text is stored verbatim as the operation's error message.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("execution timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("no modem configured for SIM slot {0}")]
    UnknownSlot(u32),

    #[error("modem I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Modem(String),
}

/// Performs a USSD dial on a SIM slot and returns the network's response.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn execute(&self, code: &str, sim_slot: u32) -> Result<String, ExecutionError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Whether a live device is reachable: at least one configured modem port exists.
pub fn is_native_device(config: &Config) -> bool {
    config.modem.ports.values().any(|path| path.exists())
}

/// Chooses the backend for this process.
pub fn select_backend(config: &Config) -> Arc<dyn ExecutionBackend> {
    if is_native_device(config) {
        log::info!(
            "Using modem backend ({} SIM slot(s) configured)",
            config.modem.ports.len()
        );
        Arc::new(ModemBackend::new(
            config.modem.ports.clone(),
            config.modem.baud_rate,
        ))
    } else {
        log::info!("No modem available, using simulated backend");
        Arc::new(SimulatedBackend::new(Duration::from_millis(
            config.simulated.delay_ms,
        )))
    }
}
