//! Device transport
//!
//! A device session talks to its unit through two halves:
//! - a `DeviceLink` used to emit events (commands, calibration queries);
//! - a channel of inbound `DeviceEvent`s (broadcasts, query responses).
//!
//! `DeviceConnector` produces both for a device URL. The production
//! connector speaks socket.io over a websocket; the loopback connector keeps
//! everything in memory for tests and dry runs.

pub mod loopback;
pub mod socketio;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use sdk::device::Broadcast;
use sdk::errors::EngineError;

pub use loopback::{LoopbackConnector, LoopbackDevice};
pub use socketio::SocketIoConnector;

/// Outbound event names
pub mod events {
    pub const COMMAND: &str = "command";
    pub const GET_ACTIVE_CALIBRATIONS: &str = "getactivecal";
    pub const GET_CALIBRATION: &str = "getcalibration";
    pub const GET_CALIBRATION_NAMES: &str = "getcalibrationnames";

    pub const BROADCAST: &str = "broadcast";
    pub const ACTIVE_CALIBRATIONS: &str = "activecalibrations";
    pub const CALIBRATION: &str = "calibration";
    pub const CALIBRATION_NAMES: &str = "calibrationnames";
}

/// Inbound device event
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Broadcast(Box<Broadcast>),
    ActiveCalibrations(Value),
    Calibration(Value),
    CalibrationNames(Value),
    /// The transport closed; no further events follow
    Disconnected,
}

impl DeviceEvent {
    /// Decode a named event, `None` for events the daemon does not handle
    pub fn decode(name: &str, payload: Value) -> Option<Result<Self, EngineError>> {
        let event = match name {
            events::BROADCAST => {
                return Some(
                    serde_json::from_value(payload)
                        .map(|b| Self::Broadcast(Box::new(b)))
                        .map_err(EngineError::from),
                )
            }
            events::ACTIVE_CALIBRATIONS => Self::ActiveCalibrations(payload),
            events::CALIBRATION => Self::Calibration(payload),
            events::CALIBRATION_NAMES => Self::CalibrationNames(payload),
            _ => return None,
        };
        Some(Ok(event))
    }
}

/// Outbound half of a device connection
pub trait DeviceLink: Send + Sync {
    /// Address the link was attached to
    fn url(&self) -> &str;

    /// Queue an event for sending; never blocks
    fn emit(&self, event: &str, payload: Value) -> Result<(), EngineError>;

    /// Tear down the connection
    fn close(&self);
}

/// A freshly attached device
pub struct DeviceChannel {
    pub link: Arc<dyn DeviceLink>,
    pub events: mpsc::Receiver<DeviceEvent>,
}

/// Attaches device sessions by URL
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Connect to the device at `url`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::DeviceUnreachable` when the unit cannot be reached.
    async fn attach(&self, url: &str) -> Result<DeviceChannel, EngineError>;
}
