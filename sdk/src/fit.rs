//! Calibration transform trait
//!
//! A fit maps a raw device value to a physical unit and back. Implementations
//! live in the engine; bioreactors only see this trait.

use crate::errors::EngineError;

/// Bidirectional raw/physical transform
pub trait Fit: Send + Sync + std::fmt::Debug {
    /// Raw device value to physical unit
    fn value(&self, raw: f64) -> Result<f64, EngineError>;

    /// Physical unit back to the raw device value
    fn inverse(&self, physical: f64) -> Result<f64, EngineError>;

    /// Derivative of `value` at `raw`, used for error propagation
    fn gradient(&self, raw: f64) -> Result<f64, EngineError>;
}
