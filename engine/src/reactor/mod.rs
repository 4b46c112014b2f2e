//! Bioreactor control laws
//!
//! A `Bioreactor` runs one control mode over a fixed set of vials on one
//! device. The shared lifecycle lives in `ReactorCore`: sensor decoding,
//! bounded OD/temperature histories, start and end times, temperature
//! correction and end-of-run stops. The mode-specific state machine is a
//! `ReactorKind` variant, built by name through `MODES`.
//!
//! Each tick `Bioreactor::update` decodes the broadcast, lets the mode queue
//! pump or temperature commands on the device's `EvolverControls`, and
//! returns an `UpdateMessage` describing what it did.

pub mod chemostat;
pub mod filters;
pub mod morbidostat;
pub mod settings;
pub mod turbidostat;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

use sdk::device::{numeric, Broadcast, CalibrationBundle, PumpChannel};
use sdk::errors::EngineError;
use sdk::fit::Fit;

use crate::calibration::FitSet;
use crate::config::DilutionConfig;
use crate::controls::EvolverControls;

pub use chemostat::Chemostat;
pub use morbidostat::Morbidostat;
pub use settings::{BaseSettings, ReactorSettings, VialParam};
pub use turbidostat::{Turbidostat, TurbidostatState};

/// Something a bioreactor did this tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// One-shot bolus; volumes in mL per channel (in1, in2, out)
    Dilution {
        vial: usize,
        volumes: [f64; 3],
        seconds: [f64; 3],
    },
    /// Recurring schedule installed; volumes are per period
    Recurrent {
        vial: usize,
        volumes: [f64; 3],
        seconds: [f64; 3],
        period: f64,
    },
    /// Vial stopped for good
    Stop { vial: usize },
    /// Morbidostat evaluation
    Growth {
        vial: usize,
        growth_rate: f64,
        response: f64,
        drug: f64,
    },
    /// Temperature setpoint moved by the control law, in °C
    Temperature { vial: usize, setpoint: f64 },
}

impl Record {
    pub fn vial(&self) -> usize {
        match self {
            Self::Dilution { vial, .. }
            | Self::Recurrent { vial, .. }
            | Self::Stop { vial }
            | Self::Growth { vial, .. }
            | Self::Temperature { vial, .. } => *vial,
        }
    }
}

/// Result of one bioreactor tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateMessage {
    pub time: f64,
    /// `None` when nothing was done this tick
    pub records: Option<Vec<Record>>,
    pub vials: Vec<usize>,
    pub od: Vec<f64>,
    pub temp: Vec<f64>,
}

/// Recurring draw on one pump channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecurringUsage {
    /// mL per period
    pub bolus: f64,
    /// Seconds; 0 cancels the schedule
    pub period: f64,
}

/// Fluid consumption described by an update message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluidUsage {
    /// mL drawn once, per vial and channel
    pub single: BTreeMap<usize, BTreeMap<PumpChannel, f64>>,
    /// Schedules installed or cancelled, per vial and channel
    pub recurring: BTreeMap<usize, BTreeMap<PumpChannel, RecurringUsage>>,
}

impl FluidUsage {
    pub fn is_empty(&self) -> bool {
        self.single.is_empty() && self.recurring.is_empty()
    }
}

/// Split the records of a message into one-shot and recurring consumption
///
/// A stop cancels every schedule on the vial.
pub fn parse_fluid_usage(message: &UpdateMessage) -> FluidUsage {
    let mut usage = FluidUsage::default();
    for record in message.records.iter().flatten() {
        match record {
            Record::Dilution { vial, volumes, .. } => {
                let entry = usage.single.entry(*vial).or_default();
                for channel in PumpChannel::ALL {
                    *entry.entry(channel).or_insert(0.0) += volumes[channel.index()];
                }
            }
            Record::Recurrent {
                vial,
                volumes,
                period,
                ..
            } => {
                let entry = usage.recurring.entry(*vial).or_default();
                for channel in PumpChannel::ALL {
                    entry.insert(
                        channel,
                        RecurringUsage {
                            bolus: volumes[channel.index()],
                            period: *period,
                        },
                    );
                }
            }
            Record::Stop { vial } => {
                let entry = usage.recurring.entry(*vial).or_default();
                for channel in PumpChannel::ALL {
                    entry.insert(
                        channel,
                        RecurringUsage {
                            bolus: 0.0,
                            period: 0.0,
                        },
                    );
                }
            }
            Record::Growth { .. } | Record::Temperature { .. } => {}
        }
    }
    usage
}

/// Readings decoded by `ReactorCore::pre_update`
#[derive(Debug, Clone, PartialEq)]
pub struct PreUpdate {
    /// False until the earliest vial start time
    pub started: bool,
    pub records: Vec<Record>,
}

/// Lifecycle shared by every control mode
#[derive(Debug)]
pub struct ReactorCore {
    name: String,
    settings: ReactorSettings,
    fits: FitSet,
    dilution: DilutionConfig,
    start_times: Vec<f64>,
    end_times: Vec<Option<f64>>,
    od_history: Vec<VecDeque<f64>>,
    temp_history: Vec<VecDeque<f64>>,
    stopped: Vec<bool>,
}

impl ReactorCore {
    /// Start and end times are measured from `now` rounded to 10 seconds.
    pub fn new(
        name: impl Into<String>,
        settings: ReactorSettings,
        fits: FitSet,
        dilution: DilutionConfig,
        now: f64,
    ) -> Self {
        let birth = (now / 10.0).round() * 10.0;
        let unit = dilution.secs_per_unit_time;
        let start_times: Vec<f64> = settings
            .start_delays
            .iter()
            .map(|delay| birth + unit * delay)
            .collect();
        let end_times = start_times
            .iter()
            .zip(settings.durations.iter())
            .map(|(start, duration)| (*duration > 0.0).then(|| start + unit * duration))
            .collect();
        let n = settings.vials.len();

        Self {
            name: name.into(),
            od_history: vec![VecDeque::with_capacity(settings.mem_len); n],
            temp_history: vec![VecDeque::with_capacity(settings.mem_len); n],
            stopped: vec![false; n],
            settings,
            fits,
            dilution,
            start_times,
            end_times,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vials(&self) -> &[usize] {
        &self.settings.vials
    }

    pub fn settings(&self) -> &ReactorSettings {
        &self.settings
    }

    pub fn fits(&self) -> &FitSet {
        &self.fits
    }

    pub fn dilution(&self) -> &DilutionConfig {
        &self.dilution
    }

    pub fn volume(&self, position: usize) -> f64 {
        self.settings.volumes[position]
    }

    pub fn start_time(&self, position: usize) -> f64 {
        self.start_times[position]
    }

    pub fn end_time(&self, position: usize) -> Option<f64> {
        self.end_times[position]
    }

    pub fn od_history(&self, position: usize) -> &VecDeque<f64> {
        &self.od_history[position]
    }

    pub fn latest_od(&self, position: usize) -> f64 {
        self.od_history[position].back().copied().unwrap_or(f64::NAN)
    }

    pub fn median_od(&self, position: usize) -> f64 {
        filters::median(&self.od_history[position])
    }

    pub fn is_stopped(&self, position: usize) -> bool {
        self.stopped[position]
    }

    /// Inside the vial's run window and not stopped
    pub fn is_active(&self, position: usize, now: f64) -> bool {
        !self.stopped[position]
            && now >= self.start_times[position]
            && self.end_times[position].map_or(true, |end| now <= end)
    }

    pub fn temp_setpoint(&self, position: usize) -> f64 {
        self.settings.temp[position]
    }

    pub fn set_temp_setpoint(&mut self, position: usize, celsius: f64) {
        self.settings.temp.set(position, celsius);
    }

    pub fn od_readings(&self) -> Vec<f64> {
        self.od_history
            .iter()
            .map(|h| h.back().copied().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn temp_readings(&self) -> Vec<f64> {
        self.temp_history
            .iter()
            .map(|h| h.back().copied().unwrap_or(f64::NAN))
            .collect()
    }

    fn raw_temperature(&self, vial: usize, celsius: f64) -> Result<f64, EngineError> {
        let fits = self.fits.vial(vial).ok_or_else(|| {
            EngineError::Calibration(format!("no temperature fit for vial {}", vial))
        })?;
        let raw = fits.temp.inverse(celsius)?;
        if raw.is_finite() {
            Ok(raw.round())
        } else {
            Err(EngineError::Fit(format!(
                "{} °C has no raw setpoint for vial {}",
                celsius, vial
            )))
        }
    }

    /// Send the configured temperature, stir and LED power to the device
    pub fn initialize(&self, controls: &mut EvolverControls) -> Result<(), EngineError> {
        let vials = self.vials();
        let raw_temps = vials
            .iter()
            .zip(self.settings.temp.iter())
            .map(|(vial, celsius)| self.raw_temperature(*vial, *celsius))
            .collect::<Result<Vec<_>, _>>()?;
        controls.update_temperature(vials, &raw_temps)?;
        controls.update_stir(vials, self.settings.stir.as_slice())?;
        controls.update_od_power(vials, self.settings.power.as_slice())?;
        Ok(())
    }

    fn decode(&self, broadcast: &Broadcast, sensor: &str, vial: usize, fit: &dyn Fit) -> f64 {
        let Some(raw) = broadcast.reading(sensor, vial) else {
            warn!(reactor = %self.name, vial, sensor, "Missing sensor reading");
            return f64::NAN;
        };
        match fit.value(raw) {
            Ok(value) if value.is_finite() => value,
            Ok(value) => {
                warn!(reactor = %self.name, vial, sensor, raw, "Non-finite reading {}", value);
                f64::NAN
            }
            Err(e) => {
                warn!(reactor = %self.name, vial, sensor, raw, "Reading outside calibration: {}", e);
                f64::NAN
            }
        }
    }

    fn push_bounded(history: &mut VecDeque<f64>, value: f64, capacity: usize) {
        if history.len() == capacity {
            history.pop_front();
        }
        history.push_back(value);
    }

    /// Stop a vial for good
    pub fn halt(&mut self, position: usize, controls: &mut EvolverControls, records: &mut Vec<Record>) {
        if self.stopped[position] {
            return;
        }
        let vial = self.settings.vials[position];
        self.stopped[position] = true;
        controls.stop_pumps(&[vial]);
        records.push(Record::Stop { vial });
        info!(reactor = %self.name, vial, "Vial stopped");
    }

    fn manage_temperature(&self, temps: &[f64], controls: &mut EvolverControls) {
        let max_diff = temps
            .iter()
            .zip(self.settings.temp.iter())
            .filter(|(reading, _)| reading.is_finite())
            .map(|(reading, setpoint)| (reading - setpoint).abs())
            .fold(0.0, f64::max);
        if max_diff <= self.dilution.delta_t {
            return;
        }

        let mut vials = Vec::new();
        let mut raw = Vec::new();
        for (vial, celsius) in self.vials().iter().zip(self.settings.temp.iter()) {
            let target = match self.raw_temperature(*vial, *celsius) {
                Ok(target) => target,
                Err(e) => {
                    warn!(reactor = %self.name, vial, "Cannot convert setpoint: {}", e);
                    continue;
                }
            };
            let echoed = controls.echoed("temp", *vial).and_then(numeric);
            if echoed != Some(target) {
                vials.push(*vial);
                raw.push(target);
            }
        }

        if vials.is_empty() {
            debug!(
                reactor = %self.name,
                max_diff,
                "Temperature off setpoint but device configuration matches"
            );
            return;
        }
        info!(reactor = %self.name, ?vials, "Device temperature setpoint differs, updating");
        if let Err(e) = controls.update_temperature(&vials, &raw) {
            warn!(reactor = %self.name, "Temperature update failed: {}", e);
        }
    }

    /// Decode a broadcast into the histories and handle start and end times
    pub fn pre_update(
        &mut self,
        broadcast: &Broadcast,
        now: f64,
        controls: &mut EvolverControls,
    ) -> PreUpdate {
        let od_sensor = self.fits.od_sensor().to_string();
        let temp_sensor = self.fits.temp_sensor().to_string();
        let mut temps = Vec::with_capacity(self.vials().len());

        for position in 0..self.vials().len() {
            let vial = self.settings.vials[position];
            let (od, temp) = match self.fits.vial(vial) {
                Some(fits) => (
                    self.decode(broadcast, &od_sensor, vial, fits.od.as_ref()),
                    self.decode(broadcast, &temp_sensor, vial, fits.temp.as_ref()),
                ),
                None => (f64::NAN, f64::NAN),
            };
            let capacity = self.settings.mem_len;
            Self::push_bounded(&mut self.od_history[position], od, capacity);
            Self::push_bounded(&mut self.temp_history[position], temp, capacity);
            temps.push(temp);
        }

        self.manage_temperature(&temps, controls);

        let first_start = self.start_times.iter().copied().fold(f64::INFINITY, f64::min);
        if now < first_start {
            debug!(reactor = %self.name, "Not at start time yet");
            return PreUpdate {
                started: false,
                records: Vec::new(),
            };
        }

        let mut records = Vec::new();
        for position in 0..self.vials().len() {
            let ended = self.end_times[position].is_some_and(|end| now > end);
            if ended && !self.stopped[position] {
                self.halt(position, controls, &mut records);
            }
        }
        PreUpdate {
            started: true,
            records,
        }
    }
}

/// Mode-specific state
#[derive(Debug)]
pub enum ReactorKind {
    Chemostat(Chemostat),
    Turbidostat(Turbidostat),
    Morbidostat(Morbidostat),
}

type Constructor = fn(&ReactorCore, &Value) -> Result<ReactorKind, EngineError>;

/// Control modes by name
pub const MODES: &[(&str, Constructor)] = &[
    ("chemostat", chemostat::build),
    ("turbidostat", turbidostat::build),
    ("morbidostat", morbidostat::build),
];

/// Everything a fragment says about one bioreactor
pub struct ReactorSpec<'a> {
    pub name: &'a str,
    pub mode: &'a str,
    pub base: &'a BaseSettings,
    pub special: &'a Value,
    pub calibration: &'a CalibrationBundle,
}

/// One control mode running over a set of vials
#[derive(Debug)]
pub struct Bioreactor {
    core: ReactorCore,
    kind: ReactorKind,
}

impl Bioreactor {
    /// Validate settings and calibration and build the reactor
    ///
    /// # Errors
    ///
    /// Unknown modes, per-vial length mismatches, bad calibration and
    /// infeasible dilution settings are all rejected here.
    pub fn build(
        spec: ReactorSpec<'_>,
        num_vials: usize,
        dilution: &DilutionConfig,
        now: f64,
    ) -> Result<Self, EngineError> {
        let mode = spec.mode.to_ascii_lowercase();
        let constructor = MODES
            .iter()
            .find(|(name, _)| *name == mode)
            .map(|(_, constructor)| *constructor)
            .ok_or_else(|| EngineError::UnknownMode(spec.mode.to_string()))?;

        let settings = spec.base.resolve()?;
        let fits = FitSet::from_bundle(spec.calibration, &settings.vials, num_vials)?;
        let core = ReactorCore::new(spec.name, settings, fits, dilution.clone(), now);
        let kind = constructor(&core, spec.special)?;
        info!(reactor = %spec.name, mode = %mode, vials = ?core.vials(), "Bioreactor built");
        Ok(Self { core, kind })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn mode(&self) -> &'static str {
        match self.kind {
            ReactorKind::Chemostat(_) => "chemostat",
            ReactorKind::Turbidostat(_) => "turbidostat",
            ReactorKind::Morbidostat(_) => "morbidostat",
        }
    }

    pub fn vials(&self) -> &[usize] {
        self.core.vials()
    }

    pub fn core(&self) -> &ReactorCore {
        &self.core
    }

    pub fn kind(&self) -> &ReactorKind {
        &self.kind
    }

    pub fn initialize(&self, controls: &mut EvolverControls) -> Result<(), EngineError> {
        self.core.initialize(controls)
    }

    /// Run one tick
    pub fn update(
        &mut self,
        broadcast: &Broadcast,
        now: f64,
        controls: &mut EvolverControls,
    ) -> UpdateMessage {
        let PreUpdate {
            started,
            mut records,
        } = self.core.pre_update(broadcast, now, controls);

        if started {
            match &mut self.kind {
                ReactorKind::Chemostat(mode) => mode.update(&mut self.core, now, controls, &mut records),
                ReactorKind::Turbidostat(mode) => {
                    mode.update(&mut self.core, now, controls, &mut records)
                }
                ReactorKind::Morbidostat(mode) => {
                    mode.update(&mut self.core, now, controls, &mut records)
                }
            }
        }

        UpdateMessage {
            time: now,
            records: (!records.is_empty()).then_some(records),
            vials: self.core.vials().to_vec(),
            od: self.core.od_readings(),
            temp: self.core.temp_readings(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = Bioreactor::build(
            ReactorSpec {
                name: "exp",
                mode: "fed-batch",
                base: &base(&[0]),
                special: &json!({}),
                calibration: &crate::calibration::test_support::identity_bundle(1),
            },
            1,
            &DilutionConfig::default(),
            T0,
        );
        assert!(matches!(result, Err(EngineError::UnknownMode(_))));
    }

    #[tokio::test]
    async fn test_bad_reading_becomes_nan() {
        let (mut controls, _device) = controls(2).await;
        let mut reactor = build(
            "turbidostat",
            &base(&[0, 1]),
            json!({"lower_thresh": 0.2, "upper_thresh": 0.5}),
            2,
        );
        let mut broadcast = broadcast(&[0.1, 0.1]);
        broadcast
            .data
            .insert("od_90".to_string(), vec![json!("garbage"), json!(0.1)]);

        let message = reactor.update(&broadcast, T0, &mut controls);
        assert!(message.od[0].is_nan());
        assert_eq!(message.od[1], 0.1);
        assert_eq!(message.records, None);
    }

    #[tokio::test]
    async fn test_waits_for_start_delay_and_stops_at_end() {
        let (mut controls, device) = controls(1).await;
        let mut base = base(&[0]);
        base.start_delays = VialParam::Uniform(1.0);
        base.durations = VialParam::Uniform(2.0);
        let mut reactor = build(
            "turbidostat",
            &base,
            json!({"lower_thresh": 0.2, "upper_thresh": 0.5}),
            1,
        );
        let start = reactor.core().start_time(0);
        assert_eq!(start, T0 + 3600.0);
        assert_eq!(reactor.core().end_time(0), Some(T0 + 3.0 * 3600.0));

        let before = reactor.update(&broadcast(&[0.9]), T0 + 60.0, &mut controls);
        assert_eq!(before.records, None);

        let after = reactor.update(&broadcast(&[0.1]), T0 + 4.0 * 3600.0, &mut controls);
        assert_eq!(after.records, Some(vec![Record::Stop { vial: 0 }]));
        controls.dispatch_queues().unwrap();
        assert_eq!(device.commands()[0].value, vec!["0", "0", "0"]);

        // the stop is reported once
        let again = reactor.update(&broadcast(&[0.1]), T0 + 5.0 * 3600.0, &mut controls);
        assert_eq!(again.records, None);
    }

    #[tokio::test]
    async fn test_temperature_corrected_only_when_echo_differs() {
        let (mut controls, device) = controls(2).await;
        let mut reactor = build(
            "turbidostat",
            &base(&[0, 1]),
            json!({"lower_thresh": 0.2, "upper_thresh": 0.5}),
            2,
        );

        let mut hot = broadcast(&[0.1, 0.1]);
        hot.data.insert("temp".to_string(), vec![json!(31.0), json!(30.0)]);
        controls.observe_broadcast(&hot);
        reactor.update(&hot, T0, &mut controls);
        assert!(device.commands().is_empty());

        hot.config.insert(
            "temp".to_string(),
            sdk::device::ParamEcho {
                value: json!(["30", "28"]),
                recurring: None,
            },
        );
        controls.observe_broadcast(&hot);
        reactor.update(&hot, T0, &mut controls);
        let commands = device.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].param, "temp");
        assert_eq!(commands[0].value, vec!["30", "30"]);
    }

    #[test]
    fn test_fluid_usage_sums_boluses_and_cancels_on_stop() {
        let message = UpdateMessage {
            time: T0,
            records: Some(vec![
                Record::Dilution {
                    vial: 2,
                    volumes: [1.0, 0.5, 6.5],
                    seconds: [1.0, 0.5, 6.5],
                },
                Record::Dilution {
                    vial: 2,
                    volumes: [1.0, 0.0, 6.0],
                    seconds: [1.0, 0.0, 6.0],
                },
                Record::Recurrent {
                    vial: 3,
                    volumes: [0.5, 0.5, 6.0],
                    seconds: [0.5, 0.5, 6.0],
                    period: 288.0,
                },
                Record::Stop { vial: 4 },
                Record::Growth {
                    vial: 5,
                    growth_rate: 0.3,
                    response: 0.1,
                    drug: 0.1,
                },
            ]),
            vials: vec![2, 3, 4, 5],
            od: vec![],
            temp: vec![],
        };

        let usage = parse_fluid_usage(&message);
        assert_eq!(usage.single[&2][&PumpChannel::In1], 2.0);
        assert_eq!(usage.single[&2][&PumpChannel::Out], 12.5);
        assert_eq!(usage.recurring[&3][&PumpChannel::In2].period, 288.0);
        assert_eq!(usage.recurring[&4][&PumpChannel::In1].period, 0.0);
        assert!(!usage.single.contains_key(&5));
        assert!(!usage.recurring.contains_key(&5));
    }

    #[test]
    fn test_records_serialize_with_kind_tag() {
        let value = serde_json::to_value(Record::Stop { vial: 3 }).unwrap();
        assert_eq!(value, json!({"kind": "stop", "vial": 3}));
    }
}
