//! Chemostat: a fixed dilution rate per vial
//!
//! Each vial gets one recurring pump schedule once its start time has passed
//! and, if a start OD is set, its median OD has crossed it. The schedule is
//! sent once; the device repeats it on its own.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use sdk::errors::EngineError;

use super::settings::{default_pump_ratios, VialCheck, VialParam, VialVec};
use super::{ReactorCore, ReactorKind, Record};
use crate::controls::{adjust_bolus_rate, BolusRate, EvolverControls};

#[derive(Debug, Clone, Deserialize)]
pub struct ChemostatSettings {
    /// Median OD a vial must exceed before its schedule starts; 0 disables
    #[serde(default)]
    pub start_od: VialParam<f64>,
    /// Bolus volume in mL
    pub bolus: VialParam<f64>,
    /// Dilutions per unit time; 0 leaves the vial unscheduled
    pub rates: VialParam<f64>,
    /// Split of the bolus between `in1` and `in2`
    #[serde(default = "default_pump_ratios")]
    pub pump_ratios: VialParam<(f64, f64)>,
}

#[derive(Debug)]
pub struct Chemostat {
    start_od: VialVec<f64>,
    ratios: VialVec<(f64, f64)>,
    schedules: Vec<Option<BolusRate>>,
    awaiting: Vec<bool>,
    check_od: bool,
}

pub(super) fn build(core: &ReactorCore, special: &Value) -> Result<ReactorKind, EngineError> {
    let settings: ChemostatSettings = serde_json::from_value(special.clone())?;
    Chemostat::new(core, &settings).map(ReactorKind::Chemostat)
}

impl Chemostat {
    pub fn new(core: &ReactorCore, settings: &ChemostatSettings) -> Result<Self, EngineError> {
        let mut check = VialCheck::new(core.vials().len());
        let start_od = check.take("start_od", &settings.start_od);
        let bolus = check.take("bolus", &settings.bolus);
        let rates = check.take("rates", &settings.rates);
        let ratios = check.take("pump_ratios", &settings.pump_ratios);
        check.finish()?;

        let mut schedules = Vec::with_capacity(rates.len());
        for (position, &vial) in core.vials().iter().enumerate() {
            if !(rates[position] > 0.0) {
                debug!(reactor = %core.name(), vial, "No dilution rate, vial left unscheduled");
                schedules.push(None);
                continue;
            }
            let schedule = adjust_bolus_rate(
                bolus[position],
                rates[position],
                core.volume(position),
                core.dilution(),
            )
            .map_err(|e| match e {
                EngineError::InfeasibleDilution(msg) => {
                    EngineError::InfeasibleDilution(format!("vial {}: {}", vial, msg))
                }
                other => other,
            })?;
            if schedule.adjusted {
                info!(
                    reactor = %core.name(),
                    vial,
                    bolus = schedule.bolus,
                    rate = schedule.rate,
                    "Adjusted bolus and rate to fit pump limits"
                );
            }
            schedules.push(Some(schedule));
        }

        Ok(Self {
            check_od: start_od.iter().any(|od| *od > 0.0),
            awaiting: schedules.iter().map(Option::is_some).collect(),
            start_od,
            ratios,
            schedules,
        })
    }

    /// Bolus and rate actually used for the vial at `position`
    pub fn schedule(&self, position: usize) -> Option<BolusRate> {
        self.schedules[position]
    }

    pub fn is_awaiting(&self, position: usize) -> bool {
        self.awaiting[position]
    }

    pub(super) fn update(
        &mut self,
        core: &mut ReactorCore,
        now: f64,
        controls: &mut EvolverControls,
        records: &mut Vec<Record>,
    ) {
        if !self.awaiting.iter().any(|a| *a) {
            return;
        }
        let mem_len = core.settings().mem_len;
        if self.check_od && (0..core.vials().len()).any(|p| core.od_history(p).len() < mem_len) {
            debug!(reactor = %core.name(), "Not enough OD readings to start");
            return;
        }

        for position in 0..core.vials().len() {
            if !self.awaiting[position] || !core.is_active(position, now) {
                continue;
            }
            let threshold = self.start_od[position];
            if threshold > 0.0 && !(core.median_od(position) > threshold) {
                continue;
            }
            let Some(schedule) = self.schedules[position] else {
                continue;
            };

            let vial = core.vials()[position];
            match controls.dilute_repeat(
                vial,
                self.ratios[position],
                schedule.bolus,
                schedule.rate,
                core.volume(position),
                core.fits(),
            ) {
                Some(repeat) => {
                    info!(
                        reactor = %core.name(),
                        vial,
                        period = repeat.period,
                        "Chemostat schedule installed"
                    );
                    records.push(Record::Recurrent {
                        vial,
                        volumes: repeat.volumes,
                        seconds: repeat.seconds,
                        period: repeat.period,
                    });
                    self.awaiting[position] = false;
                }
                None => warn!(reactor = %core.name(), vial, "Could not build chemostat schedule"),
            }
        }
    }
}
