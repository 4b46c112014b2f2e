//! Error types and handling
//!
//! This module provides the error type shared by the daemon, the device
//! sessions and the bioreactor control laws. Every variant implements
//! `EvolverErrorExt`, which gives an operator-facing hint and says whether
//! the condition can be retried.
//!
//! # Failure policy
//!
//! - Bad settings and infeasible dilution parameters are rejected when a
//!   bioreactor is constructed, before the experiment is admitted.
//! - Sensor decoding failures never surface as errors to the control loop;
//!   callers record NaN and keep going.
//! - Protocol violations close the offending connection only.

use thiserror::Error;

/// Extension trait for engine errors
///
/// Provides an operator-facing hint and recoverability information.
pub trait EvolverErrorExt {
    /// Returns a short hint safe to show in a protocol reply or CLI output
    fn user_hint(&self) -> &str;

    /// Returns whether the operation can be retried as-is
    ///
    /// Recoverable errors clear up on their own (a device coming back online,
    /// a client resending a request). Non-recoverable errors need a corrected
    /// configuration.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: invalid daemon config or experiment settings
/// - **Dilution**: bolus/rate combinations the pumps cannot deliver
/// - **Protocol**: malformed operator frames or unexpected commands
/// - **Device**: unreachable units and failed sends
/// - **Calibration**: missing or malformed fits, out-of-domain inputs
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EvolverErrorExt};
///
/// let error = EngineError::DeviceUnreachable("http://10.0.0.3:8081".to_string());
/// assert!(error.is_recoverable());
///
/// let fatal = EngineError::InfeasibleDilution("rate above limit".to_string());
/// assert!(!fatal.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Vial settings do not match {vials} vials: {fields:?}")]
    VialCountMismatch { vials: usize, fields: Vec<String> },

    #[error("Unknown control mode: {0}")]
    UnknownMode(String),

    #[error("Unknown controller: {0}")]
    UnknownController(String),

    // Dilution planning errors
    #[error("Infeasible dilution settings: {0}")]
    InfeasibleDilution(String),

    // Operator protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {size} bytes > {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Request timed out")]
    Timeout,

    // Device errors
    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Device error: {0}")]
    Device(String),

    // Calibration errors
    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Fit error: {0}")]
    Fit(String),

    // Experiment admission errors
    #[error("Staging error: {0}")]
    Staging(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvolverErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::VialCountMismatch { .. } => {
                "Every per-vial setting needs one entry per vial in the experiment"
            }
            Self::UnknownMode(_) => "Use one of: chemostat, turbidostat, morbidostat",
            Self::UnknownController(_) => "Use a supported controller type such as 'pid'",

            Self::InfeasibleDilution(_) => {
                "Lower the dilution rate or bolus volume so the pumps can keep up"
            }

            Self::Protocol(_) => "Malformed request. Check the client version",
            Self::FrameTooLarge { .. } => "Request too large",
            Self::Timeout => "The daemon took too long to respond. Try again",

            Self::DeviceUnreachable(_) => "Check that the device is powered and on the network",
            Self::Device(_) => "Device communication failed. Check the device logs",

            Self::Calibration(_) => "Calibration data is missing or malformed",
            Self::Fit(_) => "Sensor value outside the calibrated range",

            Self::Staging(_) => "Experiment fragment could not be staged",
            Self::Json(_) => "Malformed JSON document",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_)
            | Self::VialCountMismatch { .. }
            | Self::UnknownMode(_)
            | Self::UnknownController(_)
            | Self::InfeasibleDilution(_)
            | Self::Calibration(_) => false,

            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_errors_are_not_recoverable() {
        let err = EngineError::VialCountMismatch {
            vials: 4,
            fields: vec!["temp".to_string()],
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("temp"));
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert!(err.is_recoverable());
        assert_eq!(err.user_hint(), "File system operation failed");
    }
}
