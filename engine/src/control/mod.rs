//! Feedback controllers
//!
//! Controllers are named in experiment settings and built here.

pub mod pid;

use serde::{Deserialize, Serialize};

use sdk::controller::Controller;
use sdk::errors::EngineError;

pub use pid::PidController;

fn default_kind() -> String {
    "pid".to_string()
}

/// Controller entry in experiment settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSpec {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub parameters: Vec<f64>,
    pub setpoint: f64,
}

/// Build a controller evaluated `rate` times per unit time
pub fn build_controller(
    spec: &ControllerSpec,
    rate: f64,
) -> Result<Box<dyn Controller>, EngineError> {
    match spec.kind.as_str() {
        "pid" => match spec.parameters.as_slice() {
            &[kp, ki, kd, alpha] => Ok(Box::new(PidController::new(
                kp,
                ki,
                kd,
                alpha,
                spec.setpoint,
                rate,
            ))),
            other => Err(EngineError::Config(format!(
                "pid controller takes [kp, ki, kd, alpha], got {} values",
                other.len()
            ))),
        },
        other => Err(EngineError::UnknownController(other.to_string())),
    }
}
