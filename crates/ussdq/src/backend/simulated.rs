//! Stand-in backend for hosts without a modem.
//!
//! Waits a fixed delay to model network latency and always succeeds, so the
//! whole queue can run end to end without hardware.

use std::time::Duration;

use async_trait::async_trait;

use super::{ExecutionBackend, ExecutionError};

#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    delay: Duration,
}

impl SimulatedBackend {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// The response the simulator produces for a dial.
    pub fn response_for(code: &str, sim_slot: u32) -> String {
        format!("Response from {} via SIM {}: Balance: $25.50", code, sim_slot)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(1500))
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    async fn execute(&self, code: &str, sim_slot: u32) -> Result<String, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        Ok(Self::response_for(code, sim_slot))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
