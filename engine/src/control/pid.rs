//! PID controller
//!
//! Proportional-integral-derivative controller acting on
//! `err = value − setpoint`. The integral uses the trapezoid rule and is
//! zeroed whenever the proportional term changes sign; the derivative is
//! low-pass filtered with an exponential moving average.

use sdk::controller::Controller;

/// PID controller
#[derive(Debug, Clone)]
pub struct PidController {
    kp: f64,
    ki: f64,
    kd: f64,
    alpha: f64,
    setpoint: f64,
    /// Evaluations per unit time
    rate: f64,
    last_err: f64,
    p_term: f64,
    i_term: f64,
    d_term: f64,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, alpha: f64, setpoint: f64, rate: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            alpha: alpha.clamp(0.0, 1.0),
            setpoint,
            rate,
            last_err: 0.0,
            p_term: 0.0,
            i_term: 0.0,
            d_term: 0.0,
        }
    }

    /// Update setpoint
    pub fn set_target(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    /// Reset controller state
    pub fn reset(&mut self) {
        self.last_err = 0.0;
        self.p_term = 0.0;
        self.i_term = 0.0;
        self.d_term = 0.0;
    }
}

impl Controller for PidController {
    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn response(&mut self, value: f64) -> f64 {
        if !value.is_finite() {
            return 0.0;
        }
        let err = value - self.setpoint;
        let last_err = self.last_err;
        self.last_err = err;

        // Proportional
        let p = self.kp * err;

        // Integral, reset on sign change to prevent windup
        if p == 0.0 || p.signum() * self.p_term.signum() < 0.0 {
            self.i_term = 0.0;
        }
        self.p_term = p;
        if self.rate > 0.0 {
            self.i_term += self.ki * (err + last_err) / (2.0 * self.rate);
        }

        // Derivative, exponentially smoothed
        self.d_term *= 1.0 - self.alpha;
        self.d_term += self.alpha * self.kd * (err - last_err) * self.rate;

        (p + self.i_term + self.d_term).clamp(-1.0, 1.0)
    }
}
