//! Turbidostat: keep OD between two bounds
//!
//! A vial grows until its median OD reaches the upper bound, then receives a
//! bolus every tick until the latest OD falls below the lower bound. An
//! optional budget limits how many times a vial may enter dilution; a vial
//! that exhausts it is stopped for good.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use sdk::errors::EngineError;

use super::settings::{default_pump_ratios, VialCheck, VialParam, VialVec};
use super::{ReactorCore, ReactorKind, Record};
use crate::controls::EvolverControls;

fn default_steps() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurbidostatSettings {
    /// Boluses to spread one full dilution over
    #[serde(default = "default_steps")]
    pub n_dilution_steps: u32,
    /// Dilution budget per vial; absent or 0 is unlimited
    #[serde(default)]
    pub n_cycles: VialParam<Option<u32>>,
    pub lower_thresh: VialParam<f64>,
    pub upper_thresh: VialParam<f64>,
    #[serde(default = "default_pump_ratios")]
    pub pump_ratios: VialParam<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurbidostatState {
    Growth,
    Diluting,
    /// Budget exhausted; terminal
    Halted,
}

#[derive(Debug)]
pub struct Turbidostat {
    steps: u32,
    lower: VialVec<f64>,
    upper: VialVec<f64>,
    ratios: VialVec<(f64, f64)>,
    states: Vec<TurbidostatState>,
    remaining: Vec<Option<u32>>,
}

pub(super) fn build(core: &ReactorCore, special: &Value) -> Result<ReactorKind, EngineError> {
    let settings: TurbidostatSettings = serde_json::from_value(special.clone())?;
    Turbidostat::new(core, &settings).map(ReactorKind::Turbidostat)
}

impl Turbidostat {
    pub fn new(core: &ReactorCore, settings: &TurbidostatSettings) -> Result<Self, EngineError> {
        let n = core.vials().len();
        let mut check = VialCheck::new(n);
        let cycles = check.take("n_cycles", &settings.n_cycles);
        let lower = check.take("lower_thresh", &settings.lower_thresh);
        let upper = check.take("upper_thresh", &settings.upper_thresh);
        let ratios = check.take("pump_ratios", &settings.pump_ratios);
        check.finish()?;

        for (position, vial) in core.vials().iter().enumerate() {
            if !(lower[position] > 0.0 && upper[position] > lower[position]) {
                return Err(EngineError::Config(format!(
                    "vial {}: need 0 < lower_thresh < upper_thresh, got {} and {}",
                    vial, lower[position], upper[position]
                )));
            }
        }

        Ok(Self {
            steps: settings.n_dilution_steps,
            lower,
            upper,
            ratios,
            states: vec![TurbidostatState::Growth; n],
            remaining: cycles.iter().map(|c| c.filter(|c| *c > 0)).collect(),
        })
    }

    pub fn state(&self, position: usize) -> TurbidostatState {
        self.states[position]
    }

    /// `None` when the vial has no budget
    pub fn dilutions_remaining(&self, position: usize) -> Option<u32> {
        self.remaining[position]
    }

    fn halt(
        &mut self,
        position: usize,
        core: &mut ReactorCore,
        controls: &mut EvolverControls,
        records: &mut Vec<Record>,
    ) {
        self.states[position] = TurbidostatState::Halted;
        core.halt(position, controls, records);
    }

    pub(super) fn update(
        &mut self,
        core: &mut ReactorCore,
        now: f64,
        controls: &mut EvolverControls,
        records: &mut Vec<Record>,
    ) {
        for position in 0..core.vials().len() {
            if self.states[position] == TurbidostatState::Halted || !core.is_active(position, now) {
                continue;
            }
            let vial = core.vials()[position];
            let (lower, upper) = (self.lower[position], self.upper[position]);

            if self.states[position] == TurbidostatState::Growth {
                if !(core.median_od(position) >= upper) {
                    continue;
                }
                // a spent budget halts the vial at the crossing that would
                // have started one more dilution
                match self.remaining[position] {
                    Some(0) => {
                        info!(reactor = %core.name(), vial, "Dilution budget used up");
                        self.halt(position, core, controls, records);
                        continue;
                    }
                    Some(left) => self.remaining[position] = Some(left - 1),
                    None => {}
                }
                self.states[position] = TurbidostatState::Diluting;
                debug!(reactor = %core.name(), vial, remaining = ?self.remaining[position], "Dilution started");
            }

            let current = core.latest_od(position);
            if current.is_nan() {
                continue;
            }
            if current < lower {
                self.states[position] = TurbidostatState::Growth;
                continue;
            }

            if let Some(dilution) = controls.dilute_single(
                vial,
                current,
                upper,
                lower,
                self.steps,
                self.ratios[position],
                core.volume(position),
                core.fits(),
            ) {
                info!(reactor = %core.name(), vial, bolus = dilution.bolus, "Turbidostat dilution");
                records.push(Record::Dilution {
                    vial,
                    volumes: dilution.volumes,
                    seconds: dilution.seconds,
                });
            }
        }
    }
}
