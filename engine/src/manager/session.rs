//! Attached device sessions
//!
//! A session pairs an `EvolverManager` with the task that feeds it device
//! events. Broadcasts are handled one at a time, so a tick's commands are
//! dispatched before the next broadcast is looked at. Calibration responses
//! bypass the manager and go straight to whoever asked for them.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sdk::errors::EngineError;

use super::{wall_clock, EvolverManager};
use crate::config::Config;
use crate::controls::{CalibrationExchange, EvolverControls};
use crate::device::{DeviceConnector, DeviceEvent, DeviceLink};

/// One attached device
pub struct DeviceSession {
    url: String,
    manager: Arc<Mutex<EvolverManager>>,
    link: Arc<dyn DeviceLink>,
    task: JoinHandle<()>,
}

impl DeviceSession {
    /// Connect to the device at `url` and start handling its events
    ///
    /// # Errors
    ///
    /// Returns the connector's error when the device cannot be reached.
    pub async fn attach(
        connector: &dyn DeviceConnector,
        url: &str,
        config: &Config,
    ) -> Result<Self, EngineError> {
        let channel = connector.attach(url).await?;
        let exchange = Arc::new(CalibrationExchange::new());
        let controls = EvolverControls::new(
            Arc::clone(&channel.link),
            config.device.num_vials,
            config.dilution.clone(),
            Arc::clone(&exchange),
            config.device.request_timeout(),
        );
        let manager = Arc::new(Mutex::new(EvolverManager::new(controls)));
        let task = tokio::spawn(run_events(
            url.to_string(),
            Arc::clone(&manager),
            channel.events,
            exchange,
        ));
        info!(device = %url, "Device attached");

        Ok(Self {
            url: url.to_string(),
            manager,
            link: channel.link,
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn manager(&self) -> Arc<Mutex<EvolverManager>> {
        Arc::clone(&self.manager)
    }

    /// False once the device's event stream has ended
    pub fn is_connected(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the connection and stop the event task
    pub fn detach(self) {
        self.link.close();
        self.task.abort();
        info!(device = %self.url, "Device detached");
    }
}

async fn run_events(
    url: String,
    manager: Arc<Mutex<EvolverManager>>,
    mut events: mpsc::Receiver<DeviceEvent>,
    exchange: Arc<CalibrationExchange>,
) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::Broadcast(broadcast) => {
                let mut manager = manager.lock().await;
                if let Err(e) = manager.on_broadcast(&broadcast, wall_clock()).await {
                    warn!(device = %url, "Tick finished with errors: {}", e);
                }
            }
            DeviceEvent::Disconnected => break,
            response => {
                if !exchange.fulfill(response) {
                    debug!(device = %url, "Dropping unsolicited calibration response");
                }
            }
        }
    }
    error!(device = %url, "Device disconnected; not reconnecting");
}
