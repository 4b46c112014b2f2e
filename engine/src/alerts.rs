//! Low-fluid alerts
//!
//! The reconciliation loop raises an alert the first time a fluid drops
//! below the configured minimum and a custodian list is registered for it.
//! Delivery is behind `AlertSink` so a mail or chat transport can be plugged
//! in; the daemon ships with a sink that only logs.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use sdk::errors::EngineError;

/// A fluid that needs a refill
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FluidAlert {
    pub fluid: String,
    /// Remaining volume in mL
    pub volume: f64,
    pub minimum: f64,
    pub custodians: Vec<String>,
}

impl FluidAlert {
    pub fn subject(&self) -> String {
        format!("URGENT: FLUID ALERT {}", self.fluid)
    }

    pub fn body(&self) -> String {
        format!(
            "{} is below {} mL ({:.1} mL left)",
            self.fluid, self.minimum, self.volume
        )
    }
}

/// Alert delivery
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &FluidAlert) -> Result<(), EngineError>;
}

/// Sink that writes alerts to the log
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &FluidAlert) -> Result<(), EngineError> {
        warn!(
            fluid = %alert.fluid,
            volume = alert.volume,
            custodians = ?alert.custodians,
            "{}: {}",
            alert.subject(),
            alert.body()
        );
        Ok(())
    }
}
