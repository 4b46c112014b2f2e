//! Morbidostat: hold growth rate at a setpoint with drug pressure
//!
//! Every tick the OD history is smoothed into a filtered series. At most
//! `control_rate` times per unit time, an exponential fitted to that series
//! gives a growth rate, which is smoothed again over the last few
//! evaluations and fed to the vial's controller. The controller response,
//! added to an offset learned from the drug log, is the drug fraction.
//!
//! The drug reaches the vial either through an inflow pump, mixed with the
//! other inflow channel during dilutions toward the lower OD bound, or as a
//! temperature between `drug_low` and `drug_high`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use sdk::controller::Controller;
use sdk::errors::EngineError;

use super::filters::{fit_exponential, smooth};
use super::settings::{VialCheck, VialParam, VialVec};
use super::{ReactorCore, ReactorKind, Record};
use crate::control::{build_controller, ControllerSpec};
use crate::controls::EvolverControls;

/// Growth-rate estimates smoothed together
const GROWTH_FILTER_SIZE: usize = 5;
/// Drug fractions remembered for offset recalibration
const DRUG_LOG_SIZE: usize = 11;
/// Boluses per dilution toward the lower bound
const SERIAL_DILUTIONS: u32 = 3;
/// Fewest filtered points an exponential is fitted to
const MIN_FIT_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrugSource {
    #[serde(alias = "IN1")]
    In1,
    #[serde(alias = "IN2")]
    In2,
    #[serde(alias = "TEMP")]
    Temp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MorbidostatSettings {
    pub lower_thresh: VialParam<f64>,
    pub upper_thresh: VialParam<f64>,
    /// Drug level at fraction 0 (°C for a temperature source)
    pub drug_low: VialParam<f64>,
    /// Drug level at fraction 1
    pub drug_high: VialParam<f64>,
    /// Evaluations per unit time
    pub control_rate: VialParam<f64>,
    pub controllers: VialParam<ControllerSpec>,
    pub drug_source: VialParam<DrugSource>,
}

#[derive(Debug)]
struct DrugControl {
    controller: Box<dyn Controller>,
    /// Seconds between evaluations
    interval: f64,
    last_evaluation: Option<f64>,
    times: VecDeque<f64>,
    filtered: VecDeque<f64>,
    growth: VecDeque<f64>,
    growth_rate: f64,
    drug_log: VecDeque<f64>,
    offset: f64,
    /// Drug fraction of the dilution in progress
    diluting: Option<f64>,
}

impl DrugControl {
    /// Update the growth rate and return `(growth_rate, response, drug)`
    fn evaluate(&mut self, secs_per_unit_time: f64) -> Option<(f64, f64, f64)> {
        if self.filtered.len() < MIN_FIT_POINTS {
            return None;
        }
        let t0 = self.times.front().copied()?;
        let t: Vec<f64> = self.times.iter().map(|t| (t - t0) / secs_per_unit_time).collect();
        let y: Vec<f64> = self.filtered.iter().copied().collect();
        let (_, raw) = fit_exponential(&t, &y)?;

        let previous = self.growth_rate;
        if self.growth.len() == GROWTH_FILTER_SIZE {
            self.growth.pop_front();
        }
        self.growth.push_back(raw);
        let growth_rate = if self.growth.len() == GROWTH_FILTER_SIZE {
            smooth(self.growth.make_contiguous())
        } else {
            raw
        };
        self.growth_rate = growth_rate;

        let response = self.controller.response(growth_rate);
        let setpoint = self.controller.setpoint();
        if growth_rate < setpoint && previous > setpoint {
            if self.drug_log.len() == DRUG_LOG_SIZE {
                let tail = DRUG_LOG_SIZE.div_ceil(2);
                self.offset = self.drug_log.iter().rev().take(tail).sum::<f64>() / tail as f64;
            } else if let Some(last) = self.drug_log.back() {
                self.offset = *last;
            }
        }

        let drug = (self.offset + response).clamp(0.0, 1.0);
        if self.drug_log.len() == DRUG_LOG_SIZE {
            self.drug_log.pop_front();
        }
        self.drug_log.push_back(drug);
        Some((growth_rate, response, drug))
    }
}

#[derive(Debug)]
pub struct Morbidostat {
    lower: VialVec<f64>,
    upper: VialVec<f64>,
    drug_low: VialVec<f64>,
    drug_high: VialVec<f64>,
    sources: VialVec<DrugSource>,
    control: Vec<DrugControl>,
}

pub(super) fn build(core: &ReactorCore, special: &Value) -> Result<ReactorKind, EngineError> {
    let settings: MorbidostatSettings = serde_json::from_value(special.clone())?;
    Morbidostat::new(core, &settings).map(ReactorKind::Morbidostat)
}

impl Morbidostat {
    pub fn new(core: &ReactorCore, settings: &MorbidostatSettings) -> Result<Self, EngineError> {
        let mut check = VialCheck::new(core.vials().len());
        let lower = check.take("lower_thresh", &settings.lower_thresh);
        let upper = check.take("upper_thresh", &settings.upper_thresh);
        let drug_low = check.take("drug_low", &settings.drug_low);
        let drug_high = check.take("drug_high", &settings.drug_high);
        let rates = check.take("control_rate", &settings.control_rate);
        let specs = check.take("controllers", &settings.controllers);
        let sources = check.take("drug_source", &settings.drug_source);
        check.finish()?;

        let capacity = core.settings().mem_len.max(MIN_FIT_POINTS);
        let mut control = Vec::with_capacity(rates.len());
        for (position, vial) in core.vials().iter().enumerate() {
            let rate = rates[position];
            if !(rate.is_finite() && rate > 0.0) {
                return Err(EngineError::Config(format!(
                    "vial {}: control_rate must be positive, got {}",
                    vial, rate
                )));
            }
            if !(lower[position] > 0.0 && upper[position] > lower[position]) {
                return Err(EngineError::Config(format!(
                    "vial {}: need 0 < lower_thresh < upper_thresh",
                    vial
                )));
            }
            control.push(DrugControl {
                controller: build_controller(&specs[position], rate)?,
                interval: core.dilution().secs_per_unit_time / rate,
                last_evaluation: None,
                times: VecDeque::with_capacity(capacity),
                filtered: VecDeque::with_capacity(capacity),
                growth: VecDeque::with_capacity(GROWTH_FILTER_SIZE),
                growth_rate: 0.0,
                drug_log: VecDeque::with_capacity(DRUG_LOG_SIZE),
                offset: 0.0,
                diluting: None,
            });
        }

        Ok(Self {
            lower,
            upper,
            drug_low,
            drug_high,
            sources,
            control,
        })
    }

    /// Smoothed growth rate of the vial at `position`, per unit time
    pub fn growth_rate(&self, position: usize) -> f64 {
        self.control[position].growth_rate
    }

    pub fn is_diluting(&self, position: usize) -> bool {
        self.control[position].diluting.is_some()
    }

    fn record_filtered(&mut self, core: &ReactorCore, position: usize, now: f64) {
        let window: Vec<f64> = core.od_history(position).iter().copied().collect();
        let value = smooth(&window);
        if !value.is_finite() {
            return;
        }
        let capacity = core.settings().mem_len.max(MIN_FIT_POINTS);
        let control = &mut self.control[position];
        if control.filtered.len() == capacity {
            control.filtered.pop_front();
            control.times.pop_front();
        }
        control.filtered.push_back(value);
        control.times.push_back(now);
    }

    fn apply_temperature(
        &self,
        core: &mut ReactorCore,
        position: usize,
        drug: f64,
        controls: &mut EvolverControls,
        records: &mut Vec<Record>,
    ) {
        let vial = core.vials()[position];
        let (low, high) = (self.drug_low[position], self.drug_high[position]);
        let celsius = low + drug * (high - low);
        let raw = core
            .fits()
            .vial(vial)
            .ok_or_else(|| EngineError::Calibration(format!("no fits for vial {}", vial)))
            .and_then(|fits| fits.temp.inverse(celsius));
        match raw {
            Ok(raw) if raw.is_finite() => {
                core.set_temp_setpoint(position, celsius);
                if let Err(e) = controls.update_temperature(&[vial], &[raw.round()]) {
                    warn!(reactor = %core.name(), vial, "Temperature update failed: {}", e);
                }
                records.push(Record::Temperature {
                    vial,
                    setpoint: celsius,
                });
            }
            Ok(_) => warn!(reactor = %core.name(), vial, celsius, "Non-finite raw temperature"),
            Err(e) => warn!(reactor = %core.name(), vial, celsius, "Cannot set temperature: {}", e),
        }
    }

    pub(super) fn update(
        &mut self,
        core: &mut ReactorCore,
        now: f64,
        controls: &mut EvolverControls,
        records: &mut Vec<Record>,
    ) {
        let unit = core.dilution().secs_per_unit_time;

        for position in 0..core.vials().len() {
            if !core.is_active(position, now) {
                continue;
            }
            let vial = core.vials()[position];
            self.record_filtered(core, position, now);

            let control = &mut self.control[position];
            let due = control
                .last_evaluation
                .map_or(true, |last| now - last >= control.interval);
            if !due {
                continue;
            }
            let Some((growth_rate, response, drug)) = control.evaluate(unit) else {
                debug!(reactor = %core.name(), vial, "No growth rate estimate yet");
                continue;
            };
            control.last_evaluation = Some(now);
            info!(reactor = %core.name(), vial, growth_rate, drug, "Morbidostat evaluation");
            records.push(Record::Growth {
                vial,
                growth_rate,
                response,
                drug,
            });

            match self.sources[position] {
                DrugSource::Temp => self.apply_temperature(core, position, drug, controls, records),
                DrugSource::In1 | DrugSource::In2 => self.control[position].diluting = Some(drug),
            }
        }

        for position in 0..core.vials().len() {
            let Some(drug) = self.control[position].diluting else {
                continue;
            };
            if !core.is_active(position, now) {
                self.control[position].diluting = None;
                continue;
            }
            let current = core.median_od(position);
            if current.is_nan() {
                continue;
            }
            let lower = self.lower[position];
            if current < lower {
                self.control[position].diluting = None;
                continue;
            }

            let vial = core.vials()[position];
            let ratio = match self.sources[position] {
                DrugSource::In2 => (1.0 - drug, drug),
                _ => (drug, 1.0 - drug),
            };
            if let Some(dilution) = controls.dilute_single(
                vial,
                current,
                self.upper[position],
                lower,
                SERIAL_DILUTIONS,
                ratio,
                core.volume(position),
                core.fits(),
            ) {
                records.push(Record::Dilution {
                    vial,
                    volumes: dilution.volumes,
                    seconds: dilution.seconds,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::test_support::build;
    use super::super::{Bioreactor, ReactorKind};
    use super::*;
    use serde_json::json;

    fn morbidostat(reactor: &Bioreactor) -> &Morbidostat {
        match reactor.kind() {
            ReactorKind::Morbidostat(m) => m,
            other => panic!("not a morbidostat: {other:?}"),
        }
    }

    fn settings(source: &str) -> serde_json::Value {
        json!({
            "lower_thresh": 0.2,
            "upper_thresh": 0.6,
            "drug_low": 30.0,
            "drug_high": 40.0,
            "control_rate": 60.0,
            "controllers": {"parameters": [10.0, 0.0, 0.0, 0.5], "setpoint": 0.0},
            "drug_source": source
        })
    }

    /// OD doubling every unit time, sampled once a minute
    fn od_at(minute: usize) -> f64 {
        0.05 * 2f64.powf(minute as f64 / 60.0)
    }

    #[tokio::test]
    async fn test_growth_drives_temperature() {
        let (mut controls, device) = controls(1).await;
        let mut reactor = build("morbidostat", &base(&[0]), settings("temp"), 1);

        let mut evaluations = Vec::new();
        for minute in 0..8 {
            let now = T0 + 60.0 * minute as f64;
            let message = reactor.update(&broadcast(&[od_at(minute)]), now, &mut controls);
            for record in message.records.into_iter().flatten() {
                evaluations.push(record);
            }
        }

        let growth: Vec<f64> = evaluations
            .iter()
            .filter_map(|r| match r {
                Record::Growth { growth_rate, .. } => Some(*growth_rate),
                _ => None,
            })
            .collect();
        assert!(!growth.is_empty());
        // ln 2 per unit time, slightly biased by the filter
        let last = *growth.last().unwrap();
        assert!((last - std::f64::consts::LN_2).abs() < 0.05, "growth rate {last}");

        // growth above a 0 setpoint pushes the drug to its maximum
        assert!(evaluations.contains(&Record::Temperature { vial: 0, setpoint: 40.0 }));
        assert_eq!(reactor.core().temp_setpoint(0), 40.0);
        assert!(device.commands().iter().any(|c| c.param == "temp" && c.value == vec!["40"]));
    }

    #[tokio::test]
    async fn test_pump_source_dilutes_with_drug_mix() {
        let (mut controls, _device) = controls(1).await;
        let mut settings = settings("in2");
        settings["lower_thresh"] = json!(0.01);
        let mut reactor = build("morbidostat", &base(&[0]), settings, 1);

        let mut dilutions = Vec::new();
        for minute in 0..6 {
            let now = T0 + 60.0 * minute as f64;
            let message = reactor.update(&broadcast(&[od_at(minute)]), now, &mut controls);
            for record in message.records.into_iter().flatten() {
                if let Record::Dilution { volumes, .. } = record {
                    dilutions.push(volumes);
                }
            }
        }

        assert!(morbidostat(&reactor).is_diluting(0));
        let volumes = dilutions.last().unwrap();
        // drug fraction 1 through in2
        assert_eq!(volumes[0], 0.0);
        assert!(volumes[1] > 0.0);
    }

    #[tokio::test]
    async fn test_evaluations_are_rate_limited() {
        let (mut controls, _device) = controls(1).await;
        let mut settings = settings("temp");
        settings["control_rate"] = json!(1.0);
        let mut reactor = build("morbidostat", &base(&[0]), settings, 1);

        let mut evaluations = 0;
        for minute in 0..30 {
            let now = T0 + 60.0 * minute as f64;
            let message = reactor.update(&broadcast(&[od_at(minute)]), now, &mut controls);
            evaluations += message
                .records
                .into_iter()
                .flatten()
                .filter(|r| matches!(r, Record::Growth { .. }))
                .count();
        }
        // once per hour
        assert_eq!(evaluations, 1);
    }

    #[test]
    fn test_drug_source_accepts_upper_case() {
        let source: DrugSource = serde_json::from_value(json!("IN1")).unwrap();
        assert_eq!(source, DrugSource::In1);
    }

    fn drug_control(drug_log: Vec<f64>) -> DrugControl {
        DrugControl {
            // kp = 0: the drug fraction is the offset alone
            controller: build_controller(
                &ControllerSpec {
                    kind: "pid".to_string(),
                    parameters: vec![0.0, 0.0, 0.0, 0.5],
                    setpoint: 0.5,
                },
                1.0,
            )
            .unwrap(),
            interval: 3600.0,
            last_evaluation: None,
            times: (0..3).map(|i| i as f64 * 3600.0).collect(),
            // grows 10% per unit time, below the setpoint
            filtered: [0.3, 0.33, 0.363].into_iter().collect(),
            growth: VecDeque::new(),
            growth_rate: 1.0,
            drug_log: drug_log.into_iter().collect(),
            offset: 0.0,
            diluting: None,
        }
    }

    #[test]
    fn test_offset_takes_last_drug_when_log_is_short() {
        let mut control = drug_control(vec![0.2, 0.4]);
        let (growth_rate, _, drug) = control.evaluate(3600.0).unwrap();
        assert!((growth_rate - 1.1f64.ln()).abs() < 1e-6);
        assert_eq!(control.offset, 0.4);
        assert_eq!(drug, 0.4);
    }

    #[test]
    fn test_offset_averages_tail_of_full_log() {
        let log: Vec<f64> = (0..DRUG_LOG_SIZE).map(|i| i as f64 / 10.0).collect();
        let mut control = drug_control(log);
        let (_, _, drug) = control.evaluate(3600.0).unwrap();
        // mean of the last six entries, 0.5 through 1.0
        assert!((control.offset - 0.75).abs() < 1e-9);
        assert!((drug - 0.75).abs() < 1e-9);
        assert_eq!(control.drug_log.len(), DRUG_LOG_SIZE);
    }

    #[test]
    fn test_offset_kept_without_crossing() {
        let mut control = drug_control(vec![0.2, 0.4]);
        control.growth_rate = 0.05;
        control.offset = 0.1;
        let (_, _, drug) = control.evaluate(3600.0).unwrap();
        assert_eq!(control.offset, 0.1);
        assert_eq!(drug, 0.1);
    }
}
