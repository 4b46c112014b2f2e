//! Fluid inventory
//!
//! Tracks how much of each named fluid is left. Experiments declare which
//! fluid feeds each inflow pump of each vial; the reconciliation loop then
//! subtracts what the pumps draw:
//!
//! - one-shot dilutions are subtracted as soon as they are reported;
//! - recurring schedules are charged per whole elapsed period, and the
//!   remainder of a partial period is carried to the next pass.
//!
//! A fluid stays in the inventory exactly as long as some vial draws it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use sdk::device::PumpChannel;

use crate::manager::FluidUpdate;

/// Channels that draw from a fluid reservoir
pub const INFLOW: [PumpChannel; 2] = [PumpChannel::In1, PumpChannel::In2];

/// A vial on a device
pub type VialKey = (String, usize);

/// Recurring draw installed by a schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringDraw {
    pub fluid: String,
    /// mL per period
    pub bolus: f64,
    /// Seconds
    pub period: f64,
    /// Time up to which the draw has been charged
    pub last_applied: f64,
}

#[derive(Debug, Default)]
pub struct FluidInventory {
    volumes: BTreeMap<String, f64>,
    keys: BTreeMap<VialKey, BTreeMap<PumpChannel, String>>,
    users: BTreeMap<String, BTreeSet<VialKey>>,
    recurring: BTreeMap<(VialKey, PumpChannel), RecurringDraw>,
    low: BTreeSet<String>,
}

impl FluidInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining volume of `fluid` in mL
    pub fn volume(&self, fluid: &str) -> Option<f64> {
        self.volumes.get(fluid).copied()
    }

    pub fn volumes(&self) -> &BTreeMap<String, f64> {
        &self.volumes
    }

    /// Fluid drawn by `channel` of a vial
    pub fn fluid_for(&self, url: &str, vial: usize, channel: PumpChannel) -> Option<&str> {
        self.keys
            .get(&(url.to_string(), vial))?
            .get(&channel)
            .map(String::as_str)
    }

    pub fn recurring_draw(&self, url: &str, vial: usize, channel: PumpChannel) -> Option<&RecurringDraw> {
        self.recurring.get(&((url.to_string(), vial), channel))
    }

    /// Fluids currently below the minimum
    pub fn needs_refill(&self) -> &BTreeSet<String> {
        &self.low
    }

    /// Record which fluids the vials of a new bioreactor draw
    ///
    /// Fluids seen for the first time start empty until refilled. Efflux
    /// entries are ignored.
    pub fn register(&mut self, url: &str, fluid_key: &BTreeMap<usize, BTreeMap<PumpChannel, String>>) {
        for (&vial, channels) in fluid_key {
            let key = (url.to_string(), vial);
            let mut inflow = BTreeMap::new();
            for (&channel, fluid) in channels {
                if !INFLOW.contains(&channel) {
                    continue;
                }
                if !self.volumes.contains_key(fluid) {
                    info!(fluid = %fluid, "Tracking new fluid");
                    self.volumes.insert(fluid.clone(), 0.0);
                }
                self.users
                    .entry(fluid.clone())
                    .or_default()
                    .insert(key.clone());
                inflow.insert(channel, fluid.clone());
            }
            self.keys.insert(key, inflow);
        }
    }

    /// Forget the vials of an ended experiment
    ///
    /// Returns the fluids that no vial draws any more; they are removed.
    pub fn release(&mut self, url: &str, vials: &[usize]) -> Vec<String> {
        for &vial in vials {
            let key = (url.to_string(), vial);
            let Some(channels) = self.keys.remove(&key) else {
                continue;
            };
            for (channel, fluid) in channels {
                if let Some(users) = self.users.get_mut(&fluid) {
                    users.remove(&key);
                }
                self.recurring.remove(&(key.clone(), channel));
            }
        }

        let unused: Vec<String> = self
            .users
            .iter()
            .filter(|(_, users)| users.is_empty())
            .map(|(fluid, _)| fluid.clone())
            .collect();
        for fluid in &unused {
            self.users.remove(fluid);
            self.volumes.remove(fluid);
            self.low.remove(fluid);
            info!(fluid = %fluid, "Fluid no longer in use");
        }
        unused
    }

    /// Overwrite volumes of known fluids
    ///
    /// Unknown names are skipped and returned.
    pub fn refill(&mut self, volumes: &HashMap<String, f64>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (fluid, volume) in volumes {
            match self.volumes.get_mut(fluid) {
                Some(current) => {
                    info!(fluid = %fluid, from = *current, to = *volume, "Fluid refilled");
                    *current = *volume;
                }
                None => unknown.push(fluid.clone()),
            }
        }
        unknown
    }

    /// Charge the consumption reported by a device tick
    pub fn apply(&mut self, update: &FluidUpdate, now: f64) {
        for (&vial, channels) in &update.usage.single {
            for channel in INFLOW {
                let Some(amount) = channels.get(&channel) else {
                    continue;
                };
                let Some(fluid) = self.fluid_for(&update.url, vial, channel).map(str::to_string)
                else {
                    continue;
                };
                if let Some(volume) = self.volumes.get_mut(&fluid) {
                    *volume -= amount;
                }
            }
        }

        for (&vial, channels) in &update.usage.recurring {
            for channel in INFLOW {
                let Some(usage) = channels.get(&channel) else {
                    continue;
                };
                let slot = ((update.url.clone(), vial), channel);
                if usage.period <= 0.0 {
                    if self.recurring.remove(&slot).is_some() {
                        debug!(device = %update.url, vial, %channel, "Recurring draw cancelled");
                    }
                    continue;
                }
                let Some(fluid) = self.fluid_for(&update.url, vial, channel).map(str::to_string)
                else {
                    continue;
                };
                self.recurring.insert(
                    slot,
                    RecurringDraw {
                        fluid,
                        bolus: usage.bolus,
                        period: usage.period,
                        last_applied: now,
                    },
                );
            }
        }
    }

    /// Charge every recurring draw for the whole periods elapsed by `now`
    pub fn advance(&mut self, now: f64) {
        for draw in self.recurring.values_mut() {
            let elapsed = now - draw.last_applied;
            if !(elapsed > draw.period) {
                continue;
            }
            let periods = (elapsed / draw.period).floor();
            draw.last_applied += periods * draw.period;
            if let Some(volume) = self.volumes.get_mut(&draw.fluid) {
                *volume -= periods * draw.bolus;
            }
        }
    }

    /// Fluids that dropped below `minimum` since the last check
    ///
    /// Fluids back at or above the minimum are re-armed.
    pub fn check_levels(&mut self, minimum: f64) -> Vec<(String, f64)> {
        let mut newly_low = Vec::new();
        for (fluid, &volume) in &self.volumes {
            if volume < minimum {
                if self.low.insert(fluid.clone()) {
                    newly_low.push((fluid.clone(), volume));
                }
            } else {
                self.low.remove(fluid);
            }
        }
        newly_low
    }
}
