//! Per-device experiment session
//!
//! An `EvolverManager` owns the command queues of one device and every
//! bioreactor running on it. Each broadcast is handled start to finish
//! before the next one:
//!
//! 1. reset the queues and remember the device's configuration echo
//! 2. update every bioreactor, which queues pump and setpoint commands
//! 3. turn the records of each update into fluid usage for the daemon
//! 4. send the queued commands (at most one immediate and one recurring)
//! 5. append the readings to the experiment's log files
//!
//! Log lines are `"{time}, {value}"` under `OD/{vial}`, `temp/{vial}` and
//! `raw_data/{series}/{vial}` in the experiment's working directory.

pub mod session;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use sdk::device::Broadcast;
use sdk::errors::EngineError;
use serde_json::Value;

use crate::controls::EvolverControls;
use crate::reactor::{parse_fluid_usage, Bioreactor, FluidUsage};

pub use session::DeviceSession;

/// Fluid consumed on a device during one tick
#[derive(Debug, Clone, PartialEq)]
pub struct FluidUpdate {
    pub url: String,
    pub time: f64,
    pub usage: FluidUsage,
}

struct ActiveReactor {
    experiment: String,
    reactor: Bioreactor,
    working_dir: PathBuf,
}

/// Current wall clock time in seconds
pub fn wall_clock() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Experiments running on one device
pub struct EvolverManager {
    controls: EvolverControls,
    reactors: Vec<ActiveReactor>,
    updates: Vec<FluidUpdate>,
}

impl EvolverManager {
    pub fn new(controls: EvolverControls) -> Self {
        Self {
            controls,
            reactors: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        self.controls.url()
    }

    pub fn controls(&self) -> &EvolverControls {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut EvolverControls {
        &mut self.controls
    }

    pub fn has_no_active_experiments(&self) -> bool {
        self.reactors.is_empty()
    }

    /// Names of the experiments running here
    pub fn experiments(&self) -> BTreeSet<&str> {
        self.reactors.iter().map(|a| a.experiment.as_str()).collect()
    }

    /// Vials claimed by any bioreactor
    pub fn occupied_vials(&self) -> BTreeSet<usize> {
        self.reactors
            .iter()
            .flat_map(|a| a.reactor.vials().iter().copied())
            .collect()
    }

    pub fn reactors(&self) -> impl Iterator<Item = (&str, &Bioreactor)> {
        self.reactors
            .iter()
            .map(|a| (a.experiment.as_str(), &a.reactor))
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    /// Take the fluid updates gathered since the last call
    pub fn drain_updates(&mut self) -> Vec<FluidUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// Register a bioreactor under `experiment`
    ///
    /// The reactor's temperature, stir and LED settings are sent to the
    /// device right away.
    ///
    /// # Errors
    ///
    /// Fails without side effects if a vial is out of range for the device or
    /// already belongs to another bioreactor. Fails after registration only if
    /// the initial settings cannot be sent.
    pub fn add_experiment(
        &mut self,
        experiment: &str,
        reactor: Bioreactor,
        working_dir: PathBuf,
    ) -> Result<(), EngineError> {
        let num_vials = self.controls.num_vials();
        if let Some(vial) = reactor.vials().iter().find(|v| **v >= num_vials) {
            return Err(EngineError::Config(format!(
                "vial {} does not exist on {} ({} vials)",
                vial,
                self.url(),
                num_vials
            )));
        }
        let occupied = self.occupied_vials();
        let taken: Vec<usize> = reactor
            .vials()
            .iter()
            .copied()
            .filter(|v| occupied.contains(v))
            .collect();
        if !taken.is_empty() {
            return Err(EngineError::Config(format!(
                "vials {:?} on {} are already in use",
                taken,
                self.url()
            )));
        }

        info!(
            device = %self.url(),
            experiment,
            mode = reactor.mode(),
            vials = ?reactor.vials(),
            "Adding experiment"
        );
        reactor.initialize(&mut self.controls)?;
        self.reactors.push(ActiveReactor {
            experiment: experiment.to_string(),
            reactor,
            working_dir,
        });
        Ok(())
    }

    /// Remove every bioreactor of `experiment` and stop its pumps
    ///
    /// Returns the vials that were released; unknown experiments release none.
    pub fn end_experiment(&mut self, experiment: &str) -> Vec<usize> {
        let (ended, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.reactors)
            .into_iter()
            .partition(|a| a.experiment == experiment);
        self.reactors = kept;
        if ended.is_empty() {
            return Vec::new();
        }

        let vials: Vec<usize> = ended
            .iter()
            .flat_map(|a| a.reactor.vials().iter().copied())
            .collect();
        self.controls.stop_pumps(&vials);
        if let Err(e) = self.controls.dispatch_queues() {
            warn!(device = %self.url(), experiment, "Failed to stop pumps: {}", e);
        }
        info!(device = %self.url(), experiment, ?vials, "Experiment ended");
        vials
    }

    pub fn lock(&mut self) -> Result<(), EngineError> {
        self.controls.lock()
    }

    pub fn unlock(&mut self) -> Result<(), EngineError> {
        self.controls.unlock()
    }

    /// Handle one broadcast
    ///
    /// Returns the number of command messages sent to the device.
    pub async fn on_broadcast(
        &mut self,
        broadcast: &Broadcast,
        now: f64,
    ) -> Result<usize, EngineError> {
        debug!(device = %self.url(), "Broadcast received");
        self.controls.observe_broadcast(broadcast);
        self.controls.reset_queues();

        let mut logs = LogBatch::default();
        for active in &mut self.reactors {
            let message = active.reactor.update(broadcast, now, &mut self.controls);
            let dir = &active.working_dir;

            for (position, vial) in message.vials.iter().enumerate() {
                let od = message.od.get(position).copied().unwrap_or(f64::NAN);
                let temp = message.temp.get(position).copied().unwrap_or(f64::NAN);
                logs.add(dir.join("OD").join(vial.to_string()), now, od);
                logs.add(dir.join("temp").join(vial.to_string()), now, temp);

                for (series, values) in &broadcast.data {
                    let Some(value) = values.get(*vial) else {
                        continue;
                    };
                    let path = dir.join("raw_data").join(series).join(vial.to_string());
                    logs.add(path, now, raw_text(value));
                }
            }

            let usage = parse_fluid_usage(&message);
            if !usage.is_empty() {
                self.updates.push(FluidUpdate {
                    url: self.controls.url().to_string(),
                    time: now,
                    usage,
                });
            }
        }

        let sent = self.controls.dispatch_queues();
        logs.write().await;
        sent
    }
}

fn raw_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Log lines grouped by file
#[derive(Default)]
struct LogBatch {
    files: BTreeMap<PathBuf, String>,
}

impl LogBatch {
    fn add(&mut self, path: PathBuf, time: f64, value: impl std::fmt::Display) {
        let text = self.files.entry(path).or_default();
        text.push_str(&format!("{}, {}\n", time, value));
    }

    async fn write(self) {
        for (path, text) in self.files {
            if let Err(e) = append(&path, &text).await {
                warn!(file = %path.display(), "Failed to write log: {}", e);
            }
        }
    }
}

async fn append(path: &Path, text: &str) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
