//! eVOLVER Engine Library
//!
//! This library provides the core functionality of the eVOLVER fleet daemon.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Calibration fits for sensors and pumps
pub mod calibration;

/// Feedback controllers
pub mod control;

/// Per-device command queues and dilution planning
pub mod controls;

/// Device connections and events
pub mod device;

/// Bioreactor control modes
pub mod reactor;

/// Per-device experiment manager and sessions
pub mod manager;

/// Experiment fragment staging directory
pub mod staging;

/// Low-fluid alert delivery
pub mod alerts;

/// Operator protocol framing and client
pub mod protocol;

/// Telemetry and Observability
pub mod telemetry;

/// Fleet daemon and background loops
pub mod daemon;

/// CLI interface module
pub mod cli;
