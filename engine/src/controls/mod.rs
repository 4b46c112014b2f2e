//! Per-device command queues
//!
//! `EvolverControls` owns the two command arrays of a device session (one
//! immediate, one recurring), the pause lock, and the last configuration
//! echo the device broadcast. Each array holds one slot per (channel, vial),
//! laid out channel-major; an empty slot is sent as the no-op token `--`.
//!
//! Within a tick the last write to a slot wins. `dispatch_queues` sends at
//! most one message per array and clears both.
//!
//! # Locking
//!
//! `lock()` remembers every recurring schedule the device currently runs,
//! stops those vials, and diverts later pump commands into side buffers.
//! `unlock()` reinstalls the remembered schedules and replays the diverted
//! dilutions. Both flush immediately, since the operator calls them between
//! broadcasts.

pub mod dilution;

use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use sdk::device::{Broadcast, ParamEcho, PumpChannel};
use sdk::errors::EngineError;

use crate::calibration::FitSet;
use crate::config::DilutionConfig;
use crate::device::{events, DeviceEvent, DeviceLink};

pub use dilution::{adjust_bolus_rate, compute_bolus_volume, round2, BolusRate};

/// Token the device reads as "leave this slot alone"
pub const NO_OP: &str = "--";

/// Marker separating volume and period in a recurring token
pub const SCHEDULE_MARKER: char = '|';

/// Outcome of a one-shot dilution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingleDilution {
    pub bolus: f64,
    /// mL per channel (in1, in2, out)
    pub volumes: [f64; 3],
    /// Pump seconds per channel
    pub seconds: [f64; 3],
}

/// Outcome of a recurring dilution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepeatDilution {
    pub period: f64,
    /// mL per channel per period (in1, in2, out)
    pub volumes: [f64; 3],
    /// Pump seconds per channel per period
    pub seconds: [f64; 3],
}

fn inflow_fractions(ratio: (f64, f64)) -> Option<(f64, f64)> {
    let total = ratio.0 + ratio.1;
    if !(total > 0.0) || ratio.0 < 0.0 || ratio.1 < 0.0 {
        return None;
    }
    Some((ratio.0 / total, ratio.1 / total))
}

fn format_token(x: f64) -> String {
    format!("{}", round2(x))
}

type Slot = (PumpChannel, usize);

/// Command queues and pause lock for one device
pub struct EvolverControls {
    link: Arc<dyn DeviceLink>,
    num_vials: usize,
    dilution: DilutionConfig,
    immediate: Vec<Option<String>>,
    recurring: Vec<Option<String>>,
    locked: bool,
    /// Recurring schedules to reinstall on unlock
    remembered: BTreeMap<Slot, String>,
    /// One-shot dilutions requested while locked
    paused: BTreeMap<Slot, String>,
    echo: HashMap<String, ParamEcho>,
    exchange: Arc<CalibrationExchange>,
    request_timeout: Duration,
}

impl EvolverControls {
    pub fn new(
        link: Arc<dyn DeviceLink>,
        num_vials: usize,
        dilution: DilutionConfig,
        exchange: Arc<CalibrationExchange>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            link,
            num_vials,
            dilution,
            immediate: vec![None; 3 * num_vials],
            recurring: vec![None; 3 * num_vials],
            locked: false,
            remembered: BTreeMap::new(),
            paused: BTreeMap::new(),
            echo: HashMap::new(),
            exchange,
            request_timeout,
        }
    }

    pub fn num_vials(&self) -> usize {
        self.num_vials
    }

    pub fn dilution(&self) -> &DilutionConfig {
        &self.dilution
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn url(&self) -> &str {
        self.link.url()
    }

    /// Remember the configuration echo of a broadcast
    pub fn observe_broadcast(&mut self, broadcast: &Broadcast) {
        for (param, echo) in &broadcast.config {
            self.echo.insert(param.clone(), echo.clone());
        }
    }

    /// Last echoed value of `param` for `vial`
    pub fn echoed(&self, param: &str, vial: usize) -> Option<&Value> {
        self.echo.get(param)?.values().get(vial)
    }

    fn slot(&self, channel: PumpChannel, vial: usize) -> Option<usize> {
        (vial < self.num_vials).then(|| channel.index() * self.num_vials + vial)
    }

    /// Write pump tokens into the immediate or recurring array
    ///
    /// Later writes to the same (vial, channel) in a tick replace earlier ones.
    pub fn fluid_command(&mut self, entries: &[(usize, PumpChannel, String)], recurring: bool) {
        for (vial, channel, token) in entries {
            let Some(index) = self.slot(*channel, *vial) else {
                warn!(device = %self.url(), vial, "Ignoring pump command for unknown vial");
                continue;
            };
            let queue = if recurring {
                &mut self.recurring
            } else {
                &mut self.immediate
            };
            queue[index] = Some(token.clone());
        }
    }

    /// Force zero-volume immediate tokens on every channel of `vials`
    ///
    /// A stopped vial also loses any schedule remembered by `lock()`.
    pub fn stop_pumps(&mut self, vials: &[usize]) {
        let mut entries = Vec::with_capacity(vials.len() * 3);
        for &vial in vials {
            for channel in PumpChannel::ALL {
                entries.push((vial, channel, "0".to_string()));
                self.remembered.remove(&(channel, vial));
                self.paused.remove(&(channel, vial));
            }
        }
        self.fluid_command(&entries, false);
    }

    /// Stop every pump on the device now
    pub fn stop_all_pumps(&mut self) -> Result<(), EngineError> {
        let vials: Vec<usize> = (0..self.num_vials).collect();
        self.stop_pumps(&vials);
        self.dispatch_queues().map(|_| ())
    }

    /// Drop anything queued this tick
    pub fn reset_queues(&mut self) {
        self.immediate.iter_mut().for_each(|slot| *slot = None);
        self.recurring.iter_mut().for_each(|slot| *slot = None);
    }

    /// Send the queued commands, then clear the queues
    ///
    /// Returns the number of messages emitted (0 to 2).
    pub fn dispatch_queues(&mut self) -> Result<usize, EngineError> {
        let mut sent = 0;
        let mut result = Ok(());
        for recurring in [false, true] {
            let queue = if recurring {
                &self.recurring
            } else {
                &self.immediate
            };
            if queue.iter().all(Option::is_none) {
                continue;
            }
            let value: Vec<String> = queue
                .iter()
                .map(|slot| slot.clone().unwrap_or_else(|| NO_OP.to_string()))
                .collect();
            let payload = json!({
                "param": "pump",
                "value": value,
                "recurring": recurring,
                "immediate": !recurring,
            });
            match self.link.emit(events::COMMAND, payload) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(device = %self.url(), "Failed to dispatch pump commands: {}", e);
                    result = Err(e);
                }
            }
        }
        self.reset_queues();
        result.map(|_| sent)
    }

    /// Pause pumping on this device
    ///
    /// No-op when already locked.
    pub fn lock(&mut self) -> Result<(), EngineError> {
        if self.locked {
            return Ok(());
        }

        let mut vials = BTreeSet::new();
        if let Some(pump) = self.echo.get("pump") {
            for (index, token) in pump.values().iter().enumerate() {
                let Some(token) = token.as_str() else { continue };
                if !token.contains(SCHEDULE_MARKER) {
                    continue;
                }
                let Some(channel) = PumpChannel::from_index(index / self.num_vials) else {
                    continue;
                };
                let vial = index % self.num_vials;
                self.remembered.insert((channel, vial), token.to_string());
                vials.insert(vial);
            }
        }

        let remembered = std::mem::take(&mut self.remembered);
        self.stop_pumps(&vials.into_iter().collect::<Vec<_>>());
        self.remembered = remembered;
        self.locked = true;
        info!(
            device = %self.url(),
            schedules = self.remembered.len(),
            "Pumps locked"
        );
        self.dispatch_queues().map(|_| ())
    }

    /// Resume pumping on this device
    ///
    /// No-op when not locked.
    pub fn unlock(&mut self) -> Result<(), EngineError> {
        if !self.locked {
            return Ok(());
        }

        let remembered: Vec<_> = std::mem::take(&mut self.remembered)
            .into_iter()
            .map(|((channel, vial), token)| (vial, channel, token))
            .collect();
        let paused: Vec<_> = std::mem::take(&mut self.paused)
            .into_iter()
            .map(|((channel, vial), token)| (vial, channel, token))
            .collect();

        self.fluid_command(&remembered, true);
        self.fluid_command(&paused, false);
        self.locked = false;
        info!(
            device = %self.url(),
            schedules = remembered.len(),
            dilutions = paused.len(),
            "Pumps unlocked"
        );
        self.dispatch_queues().map(|_| ())
    }

    fn queue_pump_tokens(&mut self, vial: usize, tokens: [String; 3], recurring: bool) {
        if self.locked {
            let buffer = if recurring {
                &mut self.remembered
            } else {
                &mut self.paused
            };
            for (channel, token) in PumpChannel::ALL.into_iter().zip(tokens) {
                buffer.insert((channel, vial), token);
            }
            debug!(device = %self.url(), vial, "Locked; holding pump command");
        } else {
            let entries: Vec<_> = PumpChannel::ALL
                .into_iter()
                .zip(tokens)
                .map(|(channel, token)| (vial, channel, token))
                .collect();
            self.fluid_command(&entries, recurring);
        }
    }

    /// Queue a one-shot bolus bringing `current` toward `lower`
    ///
    /// The bolus is split over the inflow channels by `ratio`; efflux pumps
    /// the bolus plus the outflow margin. Each channel is capped at the pump
    /// time limit. Returns `None` when no bolus is needed.
    #[allow(clippy::too_many_arguments)]
    pub fn dilute_single(
        &mut self,
        vial: usize,
        current: f64,
        upper: f64,
        lower: f64,
        steps: u32,
        ratio: (f64, f64),
        volume: f64,
        fits: &FitSet,
    ) -> Option<SingleDilution> {
        let bolus = compute_bolus_volume(current, upper, lower, steps, volume, &self.dilution);
        if bolus <= 0.0 {
            return None;
        }
        self.dilute_bolus(vial, bolus, ratio, fits)
    }

    /// Queue a one-shot bolus of a known size
    pub fn dilute_bolus(
        &mut self,
        vial: usize,
        bolus: f64,
        ratio: (f64, f64),
        fits: &FitSet,
    ) -> Option<SingleDilution> {
        let Some((f1, f2)) = inflow_fractions(ratio) else {
            warn!(vial, ?ratio, "Invalid inflow ratio, skipping dilution");
            return None;
        };
        let volumes = [
            bolus * f1,
            bolus * f2,
            bolus + self.dilution.outflow_extra,
        ];
        let mut seconds = [0.0; 3];
        for channel in PumpChannel::ALL {
            let secs = fits.pump_seconds(vial, channel, volumes[channel.index()])?;
            seconds[channel.index()] = round2(secs).min(self.dilution.pump_time_max);
        }

        self.queue_pump_tokens(vial, seconds.map(format_token), false);
        Some(SingleDilution {
            bolus,
            volumes,
            seconds,
        })
    }

    /// Queue a recurring schedule delivering `bolus` at `rate`
    ///
    /// `bolus` and `rate` must already be feasible (see `adjust_bolus_rate`).
    /// Returns `None` for a non-positive rate.
    pub fn dilute_repeat(
        &mut self,
        vial: usize,
        ratio: (f64, f64),
        bolus: f64,
        rate: f64,
        volume: f64,
        fits: &FitSet,
    ) -> Option<RepeatDilution> {
        if !(rate > 0.0) {
            return None;
        }
        let Some((f1, f2)) = inflow_fractions(ratio) else {
            warn!(vial, ?ratio, "Invalid inflow ratio, skipping schedule");
            return None;
        };
        let period = round2(dilution::dilution_period(bolus, rate, volume, &self.dilution));
        let volumes = [
            bolus * f1,
            bolus * f2,
            bolus + self.dilution.outflow_extra,
        ];
        let mut seconds = [0.0; 3];
        for channel in PumpChannel::ALL {
            let secs = fits.pump_seconds(vial, channel, volumes[channel.index()])?;
            seconds[channel.index()] = round2(secs);
        }

        let tokens = seconds.map(|s| format!("{}{}{}", format_token(s), SCHEDULE_MARKER, period));
        self.queue_pump_tokens(vial, tokens, true);
        Some(RepeatDilution {
            period,
            volumes,
            seconds,
        })
    }

    fn send_param(&mut self, param: &str, vials: &[usize], values: &[f64]) -> Result<(), EngineError> {
        let mut current: Vec<String> = (0..self.num_vials)
            .map(|vial| match self.echoed(param, vial) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => NO_OP.to_string(),
            })
            .collect();
        for (&vial, &value) in vials.iter().zip(values) {
            if vial < self.num_vials {
                current[vial] = format!("{}", value.round());
            }
        }

        // keep the local echo in step until the next broadcast
        self.echo.insert(
            param.to_string(),
            ParamEcho {
                value: json!(current),
                recurring: None,
            },
        );
        self.link.emit(
            events::COMMAND,
            json!({
                "param": param,
                "value": current,
                "recurring": false,
                "immediate": true,
            }),
        )
    }

    /// Set raw temperature setpoints for `vials`
    pub fn update_temperature(&mut self, vials: &[usize], raw: &[f64]) -> Result<(), EngineError> {
        self.send_param("temp", vials, raw)
    }

    /// Set stir rates for `vials`
    pub fn update_stir(&mut self, vials: &[usize], values: &[f64]) -> Result<(), EngineError> {
        self.send_param("stir", vials, values)
    }

    /// Set OD LED power for `vials`
    pub fn update_od_power(&mut self, vials: &[usize], values: &[f64]) -> Result<(), EngineError> {
        self.send_param("od_led", vials, values)
    }

    /// Handle for calibration queries that does not borrow the controls
    pub fn calibration_client(&self) -> CalibrationClient {
        CalibrationClient {
            link: Arc::clone(&self.link),
            exchange: Arc::clone(&self.exchange),
            timeout: self.request_timeout,
        }
    }
}

/// Routes calibration responses to whoever is waiting for them
#[derive(Default)]
pub struct CalibrationExchange {
    waiting: Mutex<HashMap<&'static str, oneshot::Sender<Value>>>,
}

impl CalibrationExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn expect(&self, response: &'static str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        // a newer request supersedes an older one
        self.waiting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(response, tx);
        rx
    }

    /// Deliver a response event; returns false if nobody was waiting
    pub fn fulfill(&self, event: DeviceEvent) -> bool {
        let (name, payload) = match event {
            DeviceEvent::ActiveCalibrations(v) => (events::ACTIVE_CALIBRATIONS, v),
            DeviceEvent::Calibration(v) => (events::CALIBRATION, v),
            DeviceEvent::CalibrationNames(v) => (events::CALIBRATION_NAMES, v),
            _ => return false,
        };
        let waiter = self
            .waiting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
        match waiter {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }
}

/// Request/response calibration queries against one device
#[derive(Clone)]
pub struct CalibrationClient {
    link: Arc<dyn DeviceLink>,
    exchange: Arc<CalibrationExchange>,
    timeout: Duration,
}

impl CalibrationClient {
    async fn query(&self, request: &str, payload: Value, response: &'static str) -> Option<Value> {
        let rx = self.exchange.expect(response);
        if let Err(e) = self.link.emit(request, payload) {
            warn!(device = %self.link.url(), "Calibration request failed: {}", e);
            return None;
        }
        match timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            _ => {
                warn!(device = %self.link.url(), request, "No calibration response");
                None
            }
        }
    }

    /// Calibrations currently active on the device
    pub async fn active_calibrations(&self) -> Option<Value> {
        self.query(
            events::GET_ACTIVE_CALIBRATIONS,
            json!({}),
            events::ACTIVE_CALIBRATIONS,
        )
        .await
    }

    /// One stored calibration by name
    pub async fn calibration(&self, name: &str) -> Option<Value> {
        self.query(
            events::GET_CALIBRATION,
            json!({ "name": name }),
            events::CALIBRATION,
        )
        .await
    }

    /// Names of all stored calibrations
    pub async fn calibration_names(&self) -> Option<Value> {
        self.query(
            events::GET_CALIBRATION_NAMES,
            json!({}),
            events::CALIBRATION_NAMES,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::identity_bundle;
    use crate::device::{DeviceConnector, LoopbackConnector, LoopbackDevice};

    async fn controls(num_vials: usize) -> (EvolverControls, Arc<LoopbackDevice>) {
        let connector = LoopbackConnector::new();
        let channel = connector.attach("http://unit").await.unwrap();
        let device = connector.device("http://unit").unwrap();
        let controls = EvolverControls::new(
            channel.link,
            num_vials,
            DilutionConfig::default(),
            Arc::new(CalibrationExchange::new()),
            Duration::from_millis(200),
        );
        (controls, device)
    }

    fn echo_pump(controls: &mut EvolverControls, tokens: Vec<&str>) {
        let mut broadcast = Broadcast::default();
        broadcast.config.insert(
            "pump".to_string(),
            ParamEcho {
                value: json!(tokens),
                recurring: None,
            },
        );
        controls.observe_broadcast(&broadcast);
    }

    #[tokio::test]
    async fn test_last_write_wins_within_a_tick() {
        let (mut controls, device) = controls(2).await;
        controls.fluid_command(&[(1, PumpChannel::In1, "3".to_string())], false);
        controls.fluid_command(&[(1, PumpChannel::In1, "7".to_string())], false);
        assert_eq!(controls.dispatch_queues().unwrap(), 1);

        let commands = device.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].value, vec!["--", "7", "--", "--", "--", "--"]);
        assert!(commands[0].immediate);
    }

    #[tokio::test]
    async fn test_dispatch_clears_queues() {
        let (mut controls, device) = controls(2).await;
        controls.fluid_command(&[(0, PumpChannel::Out, "1|300".to_string())], true);
        assert_eq!(controls.dispatch_queues().unwrap(), 1);
        assert_eq!(controls.dispatch_queues().unwrap(), 0);
        assert!(device.commands()[0].recurring);
    }

    #[tokio::test]
    async fn test_lock_stops_scheduled_vials_once() {
        let (mut controls, device) = controls(2).await;
        echo_pump(&mut controls, vec!["--", "2|300", "--", "2|300", "--", "7|300"]);

        controls.lock().unwrap();
        controls.lock().unwrap();

        let commands = device.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].value, vec!["--", "0", "--", "0", "--", "0"]);
        assert!(controls.is_locked());
    }

    #[tokio::test]
    async fn test_unlock_restores_schedule() {
        let (mut controls, device) = controls(2).await;
        let schedule = vec!["--", "2|300", "--", "2|300", "--", "7|300"];
        echo_pump(&mut controls, schedule.clone());

        controls.lock().unwrap();
        device.clear();
        controls.unlock().unwrap();
        controls.unlock().unwrap();

        let commands = device.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].recurring);
        assert_eq!(commands[0].value, schedule);
        assert!(!controls.is_locked());
    }

    #[tokio::test]
    async fn test_dilutions_held_while_locked() {
        let (mut controls, device) = controls(2).await;
        let fits = FitSet::from_bundle(&identity_bundle(2), &[0, 1], 2).unwrap();
        controls.lock().unwrap();

        let outcome = controls
            .dilute_single(0, 0.3, 0.5, 0.2, 1, (1.0, 0.0), 25.0, &fits)
            .unwrap();
        assert_eq!(outcome.bolus, 12.5);
        assert_eq!(controls.dispatch_queues().unwrap(), 0);

        controls.unlock().unwrap();
        let commands = device.commands();
        let last = commands.last().unwrap();
        assert_eq!(last.value[0], "12.5");
        assert_eq!(last.value[2], "0");
        // bolus plus the 5 mL outflow margin
        assert_eq!(last.value[4], "17.5");
    }

    #[tokio::test]
    async fn test_pump_time_is_capped() {
        let (mut controls, _device) = controls(1).await;
        let fits = FitSet::from_bundle(&identity_bundle(1), &[0], 1).unwrap();
        let outcome = controls
            .dilute_single(0, 0.6, 0.5, 0.2, 1, (1.0, 1.0), 25.0, &fits)
            .unwrap();
        assert_eq!(outcome.bolus, 15.0);
        assert_eq!(outcome.seconds, [7.5, 7.5, 18.0]);
    }

    #[tokio::test]
    async fn test_repeat_tokens_carry_period() {
        let (mut controls, device) = controls(1).await;
        let fits = FitSet::from_bundle(&identity_bundle(1), &[0], 1).unwrap();
        let outcome = controls
            .dilute_repeat(0, (1.0, 1.0), 1.0, 0.5, 25.0, &fits)
            .unwrap();
        assert_eq!(outcome.period, 288.0);
        controls.dispatch_queues().unwrap();
        assert_eq!(device.commands()[0].value, vec!["0.5|288", "0.5|288", "6|288"]);

        assert!(controls
            .dilute_repeat(0, (1.0, 1.0), 1.0, 0.0, 25.0, &fits)
            .is_none());
    }

    #[tokio::test]
    async fn test_temperature_keeps_other_vials() {
        let (mut controls, device) = controls(3).await;
        let mut broadcast = Broadcast::default();
        broadcast.config.insert(
            "temp".to_string(),
            ParamEcho {
                value: json!(["2100", "2100", "2100"]),
                recurring: None,
            },
        );
        controls.observe_broadcast(&broadcast);

        controls.update_temperature(&[1], &[2049.6]).unwrap();
        let command = &device.commands()[0];
        assert_eq!(command.param, "temp");
        assert_eq!(command.value, vec!["2100", "2050", "2100"]);
    }

    #[tokio::test]
    async fn test_calibration_query_roundtrip_and_timeout() {
        let (controls, device) = controls(1).await;
        let client = controls.calibration_client();
        let exchange = Arc::clone(&controls.exchange);

        let waiter = tokio::spawn({
            let client = client.clone();
            async move { client.calibration_names().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(exchange.fulfill(DeviceEvent::CalibrationNames(json!(["od-1"]))));
        assert_eq!(waiter.await.unwrap(), Some(json!(["od-1"])));
        assert_eq!(device.sent()[0].0, events::GET_CALIBRATION_NAMES);

        assert_eq!(client.active_calibrations().await, None);
    }
}
