//! Per-vial experiment settings
//!
//! Every per-vial field in a fragment may be written either as a single value
//! applied to all vials or as a list with one entry per vial. `VialCheck`
//! expands each field into a `VialVec` and collects every field whose length
//! disagrees with the vial list, so a bad fragment is rejected with the full
//! list of offending fields at once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Index;

use sdk::errors::EngineError;

/// A per-vial setting as written in a fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VialParam<T> {
    PerVial(Vec<T>),
    Uniform(T),
}

impl<T: Default> Default for VialParam<T> {
    fn default() -> Self {
        Self::Uniform(T::default())
    }
}

impl<T: Clone> VialParam<T> {
    fn expand(&self, vials: usize) -> Option<Vec<T>> {
        match self {
            Self::Uniform(value) => Some(vec![value.clone(); vials]),
            Self::PerVial(values) if values.len() == vials => Some(values.clone()),
            Self::PerVial(_) => None,
        }
    }
}

/// A setting with exactly one entry per vial, indexed by vial position
#[derive(Debug, Clone, PartialEq)]
pub struct VialVec<T>(Vec<T>);

impl<T> VialVec<T> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    pub fn set(&mut self, position: usize, value: T) {
        if let Some(slot) = self.0.get_mut(position) {
            *slot = value;
        }
    }
}

impl<T> Index<usize> for VialVec<T> {
    type Output = T;

    fn index(&self, position: usize) -> &T {
        &self.0[position]
    }
}

/// Collects length mismatches while expanding per-vial settings
pub struct VialCheck {
    vials: usize,
    mismatched: Vec<String>,
}

impl VialCheck {
    pub fn new(vials: usize) -> Self {
        Self {
            vials,
            mismatched: Vec::new(),
        }
    }

    /// Expand `param`, recording `field` if its length is wrong
    ///
    /// The returned vector is only meaningful when `finish` succeeds.
    pub fn take<T: Clone>(&mut self, field: &str, param: &VialParam<T>) -> VialVec<T> {
        match param.expand(self.vials) {
            Some(values) => VialVec(values),
            None => {
                self.mismatched.push(field.to_string());
                VialVec(Vec::new())
            }
        }
    }

    pub fn finish(self) -> Result<(), EngineError> {
        if self.mismatched.is_empty() {
            Ok(())
        } else {
            Err(EngineError::VialCountMismatch {
                vials: self.vials,
                fields: self.mismatched,
            })
        }
    }
}

/// All inflow through `in1` unless a fragment says otherwise
pub fn default_pump_ratios() -> VialParam<(f64, f64)> {
    VialParam::Uniform((1.0, 0.0))
}

fn default_mem_len() -> usize {
    7
}

/// Settings shared by every control mode, as written in a fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseSettings {
    pub vials: Vec<usize>,
    /// Culture volume in mL
    pub volumes: VialParam<f64>,
    /// Length of the OD and temperature history
    #[serde(default = "default_mem_len")]
    pub mem_len: usize,
    /// Temperature setpoint in °C
    pub temp: VialParam<f64>,
    pub stir: VialParam<f64>,
    /// OD LED power
    pub power: VialParam<f64>,
    /// Unit times to wait before control starts
    #[serde(default)]
    pub start_delays: VialParam<f64>,
    /// Unit times to run after the start; 0 runs until stopped
    #[serde(default)]
    pub durations: VialParam<f64>,
}

/// Validated shared settings
#[derive(Debug, Clone, PartialEq)]
pub struct ReactorSettings {
    pub vials: Vec<usize>,
    pub volumes: VialVec<f64>,
    pub mem_len: usize,
    pub temp: VialVec<f64>,
    pub stir: VialVec<f64>,
    pub power: VialVec<f64>,
    pub start_delays: VialVec<f64>,
    pub durations: VialVec<f64>,
}

impl BaseSettings {
    pub fn resolve(&self) -> Result<ReactorSettings, EngineError> {
        if self.vials.is_empty() {
            return Err(EngineError::Config("an experiment needs at least one vial".to_string()));
        }
        let unique: BTreeSet<_> = self.vials.iter().collect();
        if unique.len() != self.vials.len() {
            return Err(EngineError::Config(format!(
                "vial list {:?} repeats a vial",
                self.vials
            )));
        }
        if self.mem_len == 0 {
            return Err(EngineError::Config("mem_len must be at least 1".to_string()));
        }

        let mut check = VialCheck::new(self.vials.len());
        let settings = ReactorSettings {
            vials: self.vials.clone(),
            volumes: check.take("volumes", &self.volumes),
            mem_len: self.mem_len,
            temp: check.take("temp", &self.temp),
            stir: check.take("stir", &self.stir),
            power: check.take("power", &self.power),
            start_delays: check.take("start_delays", &self.start_delays),
            durations: check.take("durations", &self.durations),
        };
        check.finish()?;

        if let Some(volume) = settings.volumes.iter().find(|v| !(**v > 0.0)) {
            return Err(EngineError::Config(format!(
                "vial volume must be positive, got {}",
                volume
            )));
        }
        if settings.start_delays.iter().any(|d| *d < 0.0) {
            return Err(EngineError::Config("start delays cannot be negative".to_string()));
        }
        Ok(settings)
    }
}
