//! In-memory device transport
//!
//! Records every emitted event and lets the caller inject inbound events.
//! Canned replies can be registered for calibration queries.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use sdk::device::DeviceCommand;
use sdk::errors::EngineError;

use super::{events, DeviceChannel, DeviceConnector, DeviceEvent, DeviceLink};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One simulated unit
pub struct LoopbackDevice {
    url: String,
    sent: Mutex<Vec<(String, Value)>>,
    replies: Mutex<HashMap<String, DeviceEvent>>,
    inbound: mpsc::Sender<DeviceEvent>,
    closed: AtomicBool,
}

impl LoopbackDevice {
    /// Everything emitted so far, in order
    pub fn sent(&self) -> Vec<(String, Value)> {
        guard(&self.sent).clone()
    }

    /// Emitted `command` events, decoded
    pub fn commands(&self) -> Vec<DeviceCommand> {
        guard(&self.sent)
            .iter()
            .filter(|(event, _)| event == events::COMMAND)
            .filter_map(|(_, payload)| serde_json::from_value(payload.clone()).ok())
            .collect()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        guard(&self.sent).clear();
    }

    /// Reply with `reply` whenever `query` is emitted
    pub fn reply_to(&self, query: &str, reply: DeviceEvent) {
        guard(&self.replies).insert(query.to_string(), reply);
    }

    /// Deliver an inbound event to the session
    pub async fn push(&self, event: DeviceEvent) -> Result<(), EngineError> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| EngineError::Device(format!("{} session has gone away", self.url)))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DeviceLink for LoopbackDevice {
    fn url(&self) -> &str {
        &self.url
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Device(format!("{} is closed", self.url)));
        }
        guard(&self.sent).push((event.to_string(), payload));

        if let Some(reply) = guard(&self.replies).get(event).cloned() {
            // a full channel drops the reply, which the caller sees as a timeout
            let _ = self.inbound.try_send(reply);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out loopback devices
#[derive(Default)]
pub struct LoopbackConnector {
    devices: Mutex<HashMap<String, Arc<LoopbackDevice>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device attached at `url`, if any
    pub fn device(&self, url: &str) -> Option<Arc<LoopbackDevice>> {
        guard(&self.devices).get(url).cloned()
    }

    /// Make attaching to `url` fail (or succeed again)
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        let mut set = guard(&self.unreachable);
        if unreachable {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }
}

#[async_trait]
impl DeviceConnector for LoopbackConnector {
    async fn attach(&self, url: &str) -> Result<DeviceChannel, EngineError> {
        if guard(&self.unreachable).contains(url) {
            return Err(EngineError::DeviceUnreachable(url.to_string()));
        }

        let (tx, rx) = mpsc::channel(64);
        let device = Arc::new(LoopbackDevice {
            url: url.to_string(),
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            inbound: tx,
            closed: AtomicBool::new(false),
        });
        guard(&self.devices).insert(url.to_string(), Arc::clone(&device));

        Ok(DeviceChannel {
            link: device,
            events: rx,
        })
    }
}
