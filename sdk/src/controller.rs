//! Feedback controller trait

/// Maps a measured value to a bounded corrective response
pub trait Controller: Send + std::fmt::Debug {
    /// Target value the controller drives toward
    fn setpoint(&self) -> f64;

    /// Response to a new measurement, bounded to [-1, 1]
    fn response(&mut self, value: f64) -> f64;
}
