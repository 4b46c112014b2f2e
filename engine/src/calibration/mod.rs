//! Calibration fits
//!
//! Concrete implementations of the `Fit` trait and the per-vial fit set a
//! bioreactor builds from a device calibration bundle.
//!
//! | type       | value(x)                      |
//! |------------|-------------------------------|
//! | `constant` | a                             |
//! | `linear`   | a + b·x                       |
//! | `log`      | a·ln(b·(x − c))               |
//! | `sigmoid`  | a + b / (1 + e^(d·x − c))     |
//! | `exp`      | a·e^(b·x)                     |

use std::collections::BTreeMap;
use std::sync::Arc;

use sdk::device::{CalibrationBundle, PumpChannel, SensorCalibration};
use sdk::errors::EngineError;
use sdk::fit::Fit;

type Result<T> = std::result::Result<T, EngineError>;

fn finite(x: f64, what: &str) -> Result<f64> {
    if x.is_finite() {
        Ok(x)
    } else {
        Err(EngineError::Fit(format!("{} is not finite", what)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantFit {
    pub a: f64,
}

impl Fit for ConstantFit {
    fn value(&self, _raw: f64) -> Result<f64> {
        Ok(self.a)
    }

    fn inverse(&self, _physical: f64) -> Result<f64> {
        Err(EngineError::Fit("constant fit has no inverse".to_string()))
    }

    fn gradient(&self, _raw: f64) -> Result<f64> {
        Ok(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearFit {
    pub a: f64,
    pub b: f64,
}

impl Fit for LinearFit {
    fn value(&self, raw: f64) -> Result<f64> {
        finite(self.a + self.b * raw, "linear value")
    }

    fn inverse(&self, physical: f64) -> Result<f64> {
        if self.b == 0.0 {
            return Err(EngineError::Fit("linear fit has zero slope".to_string()));
        }
        finite((physical - self.a) / self.b, "linear inverse")
    }

    fn gradient(&self, _raw: f64) -> Result<f64> {
        Ok(self.b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Fit for LogFit {
    fn value(&self, raw: f64) -> Result<f64> {
        let arg = self.b * (raw - self.c);
        if arg <= 0.0 {
            return Err(EngineError::Fit(format!("log fit undefined at {}", raw)));
        }
        finite(self.a * arg.ln(), "log value")
    }

    fn inverse(&self, physical: f64) -> Result<f64> {
        if self.a == 0.0 || self.b == 0.0 {
            return Err(EngineError::Fit("degenerate log fit".to_string()));
        }
        finite((physical / self.a).exp() / self.b + self.c, "log inverse")
    }

    fn gradient(&self, raw: f64) -> Result<f64> {
        finite(self.a / (raw - self.c), "log gradient")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SigmoidFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Fit for SigmoidFit {
    fn value(&self, raw: f64) -> Result<f64> {
        finite(
            self.a + self.b / (1.0 + (self.d * raw - self.c).exp()),
            "sigmoid value",
        )
    }

    fn inverse(&self, physical: f64) -> Result<f64> {
        let ratio = self.b / (physical - self.a);
        if !(ratio > 1.0) || self.d == 0.0 {
            return Err(EngineError::Fit(format!(
                "{} is outside the sigmoid range",
                physical
            )));
        }
        finite(((ratio - 1.0).ln() + self.c) / self.d, "sigmoid inverse")
    }

    fn gradient(&self, raw: f64) -> Result<f64> {
        let e = (self.d * raw - self.c).exp();
        finite(-self.b * self.d * e / (1.0 + e).powi(2), "sigmoid gradient")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpFit {
    pub a: f64,
    pub b: f64,
}

impl Fit for ExpFit {
    fn value(&self, raw: f64) -> Result<f64> {
        finite(self.a * (self.b * raw).exp(), "exp value")
    }

    fn inverse(&self, physical: f64) -> Result<f64> {
        let ratio = physical / self.a;
        if !(ratio > 0.0) || self.b == 0.0 {
            return Err(EngineError::Fit(format!(
                "{} is outside the exponential range",
                physical
            )));
        }
        finite(ratio.ln() / self.b, "exp inverse")
    }

    fn gradient(&self, raw: f64) -> Result<f64> {
        finite(self.a * self.b * (self.b * raw).exp(), "exp gradient")
    }
}

/// Build a fit from its type name and coefficients
pub fn build_fit(kind: &str, coefficients: &[f64]) -> Result<Arc<dyn Fit>> {
    let needed = match kind {
        "constant" => 1,
        "linear" | "exp" => 2,
        "log" => 3,
        "sigmoid" => 4,
        other => {
            return Err(EngineError::Calibration(format!(
                "unknown fit type '{}'",
                other
            )))
        }
    };
    if coefficients.len() < needed {
        return Err(EngineError::Calibration(format!(
            "{} fit needs {} coefficients, got {}",
            kind,
            needed,
            coefficients.len()
        )));
    }

    let c = coefficients;
    let fit: Arc<dyn Fit> = match kind {
        "constant" => Arc::new(ConstantFit { a: c[0] }),
        "linear" => Arc::new(LinearFit { a: c[0], b: c[1] }),
        "exp" => Arc::new(ExpFit { a: c[0], b: c[1] }),
        "log" => Arc::new(LogFit {
            a: c[0],
            b: c[1],
            c: c[2],
        }),
        _ => Arc::new(SigmoidFit {
            a: c[0],
            b: c[1],
            c: c[2],
            d: c[3],
        }),
    };
    Ok(fit)
}

fn row_fit(cal: &SensorCalibration, row: usize, what: &str) -> Result<Arc<dyn Fit>> {
    let coefficients = cal.coefficients.get(row).ok_or_else(|| {
        EngineError::Calibration(format!("{} calibration has no row {}", what, row))
    })?;
    build_fit(&cal.kind, coefficients)
}

/// Fits for one vial
#[derive(Debug, Clone)]
pub struct VialFits {
    pub od: Arc<dyn Fit>,
    pub temp: Arc<dyn Fit>,
    pub pumps: [Arc<dyn Fit>; 3],
}

/// Vial-indexed fits for one bioreactor
#[derive(Debug, Clone)]
pub struct FitSet {
    od_sensor: String,
    temp_sensor: String,
    vials: BTreeMap<usize, VialFits>,
    pump_rates: BTreeMap<usize, [f64; 3]>,
}

impl FitSet {
    /// Build fits for `vials` from a device calibration bundle
    ///
    /// Pump rows are laid out channel-major in one table of
    /// `3 × num_vials` rows. Every pump must report a positive flow rate.
    pub fn from_bundle(
        bundle: &CalibrationBundle,
        vials: &[usize],
        num_vials: usize,
    ) -> Result<Self> {
        let mut fits = BTreeMap::new();
        let mut pump_rates = BTreeMap::new();

        for &vial in vials {
            if vial >= num_vials {
                return Err(EngineError::Calibration(format!(
                    "vial {} is outside a {}-vial device",
                    vial, num_vials
                )));
            }

            let pumps = [
                row_fit(&bundle.pump, vial, "pump")?,
                row_fit(&bundle.pump, num_vials + vial, "pump")?,
                row_fit(&bundle.pump, 2 * num_vials + vial, "pump")?,
            ];
            let mut rates = [0.0; 3];
            for (channel, fit) in PumpChannel::ALL.iter().zip(pumps.iter()) {
                let rate = fit.value(0.0)?;
                if !(rate > 0.0) {
                    return Err(EngineError::Calibration(format!(
                        "pump {} of vial {} has non-positive flow rate {}",
                        channel, vial, rate
                    )));
                }
                rates[channel.index()] = rate;
            }

            fits.insert(
                vial,
                VialFits {
                    od: row_fit(&bundle.od, vial, "od")?,
                    temp: row_fit(&bundle.temp, vial, "temp")?,
                    pumps,
                },
            );
            pump_rates.insert(vial, rates);
        }

        Ok(Self {
            od_sensor: bundle
                .od
                .params
                .first()
                .cloned()
                .unwrap_or_else(|| "od_90".to_string()),
            temp_sensor: bundle
                .temp
                .params
                .first()
                .cloned()
                .unwrap_or_else(|| "temp".to_string()),
            vials: fits,
            pump_rates,
        })
    }

    /// Broadcast series OD is decoded from
    pub fn od_sensor(&self) -> &str {
        &self.od_sensor
    }

    /// Broadcast series temperature is decoded from
    pub fn temp_sensor(&self) -> &str {
        &self.temp_sensor
    }

    pub fn vial(&self, vial: usize) -> Option<&VialFits> {
        self.vials.get(&vial)
    }

    /// Flow rate in mL/s of `channel` on `vial`
    pub fn pump_rate(&self, vial: usize, channel: PumpChannel) -> Option<f64> {
        self.pump_rates.get(&vial).map(|r| r[channel.index()])
    }

    /// Seconds `channel` on `vial` must run to move `volume` mL
    pub fn pump_seconds(&self, vial: usize, channel: PumpChannel, volume: f64) -> Option<f64> {
        self.pump_rate(vial, channel).map(|rate| volume / rate)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Bundle where OD and temperature are the identity and every pump
    /// moves 1 mL/s
    pub fn identity_bundle(num_vials: usize) -> CalibrationBundle {
        let identity = SensorCalibration {
            kind: "linear".to_string(),
            params: vec![],
            coefficients: vec![vec![0.0, 1.0]; num_vials],
        };
        CalibrationBundle {
            od: SensorCalibration {
                params: vec!["od_90".to_string()],
                ..identity.clone()
            },
            temp: SensorCalibration {
                params: vec!["temp".to_string()],
                ..identity
            },
            pump: SensorCalibration {
                kind: "constant".to_string(),
                params: vec![],
                coefficients: vec![vec![1.0]; 3 * num_vials],
            },
        }
    }
}
