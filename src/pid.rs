use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// Terms of one computed control step.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PidStep {
    pub err: f64,
    pub prev_err: f64,
    pub dt: f64,
    pub term_p: f64,
    pub term_i: f64,
    pub term_d: f64,
    pub raw: f64,
    /// `raw` clamped to the output bound, in amps.
    pub output: f64,
}

/// Discrete PID over temperature error.
///
/// The integral is time weighted and is not clamped; only the output is.
/// It is cleared only by [`PidController::reset_integral`].
#[derive(Debug, Clone)]
pub struct PidController {
    target: f64,
    gains: PidGains,
    max_output: f64,
    term_i: f64,
    prev_err: Option<f64>,
    prev_time: Option<DateTime<Utc>>,
}

impl PidController {
    pub fn new(target: f64, gains: PidGains, max_output: f64) -> Self {
        Self {
            target,
            gains,
            max_output,
            term_i: 0.0,
            prev_err: None,
            prev_time: None,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn reset_integral(&mut self) {
        self.term_i = 0.0;
    }

    /// Feeds one temperature sample taken at `at`.
    ///
    /// Returns `None` on the first sample and whenever no time has passed
    /// since the previous one. The error and sample time are recorded either
    /// way.
    pub fn step(&mut self, t1: f64, at: DateTime<Utc>) -> Option<PidStep> {
        let err = t1 - self.target;
        let dt = self
            .prev_time
            .map(|prev| (at - prev).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6);

        let step = match (self.prev_err, dt) {
            (Some(prev_err), Some(dt)) if dt > 0.0 => {
                let term_p = self.gains.kp * err;
                self.term_i += self.gains.ki * dt * err;
                let term_d = self.gains.kd * (err - prev_err) / dt;
                let raw = term_p + self.term_i + term_d;
                Some(PidStep {
                    err,
                    prev_err,
                    dt,
                    term_p,
                    term_i: self.term_i,
                    term_d,
                    raw,
                    output: raw.clamp(-self.max_output, self.max_output),
                })
            }
            (Some(_), _) => {
                debug!("no time elapsed since previous sample, skipping step");
                None
            }
            (None, _) => None,
        };

        self.prev_err = Some(err);
        self.prev_time = Some(at);
        step
    }
}

/// Temperature difference across the TEC per watt; infinite at zero power.
pub fn efficiency(t1: f64, t2: f64, total_power: f64) -> f64 {
    if total_power == 0.0 {
        return f64::INFINITY;
    }
    (t1 - t2).abs() / total_power
}

/// How a signed current request maps onto the supply.
///
/// Channels 1 and 2 each sink half of the magnitude; channel 3 switches the
/// polarity relay for negative requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Drive {
    pub channel_current: f64,
    pub reverse: bool,
}

impl Drive {
    pub fn from_output(output: f64) -> Self {
        let half = output / 2.0;
        if output >= 0.0 {
            Self {
                channel_current: half,
                reverse: false,
            }
        } else {
            Self {
                channel_current: -half,
                reverse: true,
            }
        }
    }
}
