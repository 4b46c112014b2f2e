//! Bolus sizing and recurring-schedule feasibility
//!
//! Shared by the turbidostat/morbidostat one-shot dilutions and the chemostat
//! recurring schedule.

use sdk::errors::EngineError;

use crate::config::DilutionConfig;

/// Round to the resolution the device accepts.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Result of `adjust_bolus_rate`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusRate {
    /// Bolus volume in mL
    pub bolus: f64,
    /// Dilution rate in volumes per unit time
    pub rate: f64,
    /// Whether either value had to change
    pub adjusted: bool,
}

impl BolusRate {
    /// Seconds between boluses
    pub fn period(&self, volume: f64, cfg: &DilutionConfig) -> f64 {
        dilution_period(self.bolus, self.rate, volume, cfg)
    }
}

/// Seconds between boluses that deliver `rate` volumes per unit time
pub fn dilution_period(bolus: f64, rate: f64, volume: f64, cfg: &DilutionConfig) -> f64 {
    cfg.secs_per_unit_time * bolus / (rate * volume)
}

/// Make a bolus/rate pair deliverable by a recurring pump schedule.
///
/// The returned bolus lies in `[bolus_volume_min, bolus_repeat_max]` and the
/// implied period is at least `min_pump_period`.
///
/// # Errors
///
/// `EngineError::InfeasibleDilution` when no such pair exists, or when any
/// input is not a positive finite number.
pub fn adjust_bolus_rate(
    bolus: f64,
    rate: f64,
    volume: f64,
    cfg: &DilutionConfig,
) -> Result<BolusRate, EngineError> {
    for (name, value) in [("bolus", bolus), ("rate", rate), ("volume", volume)] {
        if !(value.is_finite() && value > 0.0) {
            return Err(EngineError::InfeasibleDilution(format!(
                "{} must be positive, got {}",
                name, value
            )));
        }
    }

    let mut bolus = bolus;
    let mut rate = rate;
    let mut adjusted = false;
    let period = dilution_period(bolus, rate, volume, cfg);

    if bolus > cfg.bolus_repeat_max {
        // same period, smaller bolus
        adjusted = true;
        rate *= cfg.bolus_repeat_max / bolus;
        bolus = cfg.bolus_repeat_max;
        if period < cfg.min_pump_period {
            return Err(EngineError::InfeasibleDilution(format!(
                "a {} mL bolus every {:.1}s is faster than the {}s pump period",
                bolus, period, cfg.min_pump_period
            )));
        }
    } else if period < cfg.min_pump_period {
        adjusted = true;
        bolus *= cfg.min_pump_period / period;
        rate *= period / cfg.min_pump_period;
        if bolus > cfg.bolus_repeat_max {
            return Err(EngineError::InfeasibleDilution(format!(
                "rate needs a {:.2} mL bolus, above the {} mL limit",
                bolus, cfg.bolus_repeat_max
            )));
        }
    }

    // scaling both keeps the period
    if bolus < cfg.bolus_volume_min {
        adjusted = true;
        rate *= cfg.bolus_volume_min / bolus;
        bolus = cfg.bolus_volume_min;
    }

    Ok(BolusRate {
        bolus,
        rate,
        adjusted,
    })
}

/// Size a one-shot bolus that brings `current` OD toward `lower`.
///
/// With `steps <= 1` a single bolus reaches `lower` outright. Otherwise the
/// bolus is sized so that the remaining number of equal dilutions, estimated
/// from where `current` sits between `lower` and `upper` in log space, reaches
/// `lower`. The estimate is biased by a robustness term so noisy readings and
/// under-pumping do not stall the vial.
///
/// Returns 0 when no dilution is needed, otherwise a volume clamped to
/// `[bolus_volume_min, bolus_volume_max]`.
pub fn compute_bolus_volume(
    current: f64,
    upper: f64,
    lower: f64,
    steps: u32,
    volume: f64,
    cfg: &DilutionConfig,
) -> f64 {
    if !(current.is_finite() && lower > 0.0 && volume > 0.0) {
        return 0.0;
    }
    let factor = current / lower;

    let single = volume * (factor - 1.0);
    let bolus = if steps <= 1 || !(upper > lower) {
        single
    } else {
        let scale = (upper / lower).ln();
        let location = f64::from(steps - 1) * factor.ln() / scale;
        let robustness = 1.0 - 2.0 * (location / f64::from(steps)).powf(cfg.pow_param);
        let dilutions_left = location + cfg.const_param * robustness;
        if dilutions_left.is_finite() && dilutions_left > 0.0 {
            (factor.powf(1.0 / dilutions_left) - 1.0) * volume
        } else {
            single
        }
    };

    if !(bolus > 0.0) {
        return 0.0;
    }
    bolus.clamp(cfg.bolus_volume_min, cfg.bolus_volume_max)
}
