//! eVOLVER SDK
//!
//! Shared types and traits for the fleet daemon: the error type, operator and
//! device wire formats, and the strategy traits injected into bioreactors.

/// Feedback controller trait
pub mod controller;

/// Device wire types
pub mod device;

/// Error types and handling
pub mod errors;

/// Calibration transform trait
pub mod fit;

/// Operator protocol message types
pub mod types;

// Re-export commonly used types
pub use controller::Controller;
pub use device::{Broadcast, CalibrationBundle, DeviceCommand, PumpChannel, SensorCalibration};
pub use errors::{EngineError, EvolverErrorExt};
pub use fit::Fit;
pub use types::{ExperimentAnnouncement, Request, Response, Status};
