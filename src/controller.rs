use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::PidConfig;
use crate::error::Result;
use crate::models::Reading;
use crate::pid::{self, Drive, PidController, PidGains, PidStep};
use crate::psu::{ChannelMeasurement, Dp832, PowerSupply};

/// Everything observed and computed during one control step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub elapsed: f64,
    pub target: f64,
    pub gains: PidGains,
    pub t1: f64,
    pub t2: f64,
    #[serde(flatten)]
    pub pid: PidStep,
    pub channels: [ChannelMeasurement; 3],
    pub total_current: f64,
    pub total_power: f64,
    pub delta_t: f64,
    pub efficiency: f64,
    /// Current that was applied before this step was computed.
    pub applied: f64,
}

pub struct TecController<P: PowerSupply> {
    pid: PidController,
    supply: Dp832<P>,
    config: PidConfig,
    config_path: PathBuf,
    t0: Option<DateTime<Utc>>,
    output: f64,
}

impl<P: PowerSupply> TecController<P> {
    pub fn new(supply: Dp832<P>, config: PidConfig, config_path: PathBuf, max_current: f64) -> Self {
        Self {
            pid: PidController::new(config.target, config.gains(), max_current),
            supply,
            config,
            config_path,
            t0: None,
            output: 0.0,
        }
    }

    /// Applies the last computed current, reads the supply back and feeds the
    /// reading to the PID loop.
    pub async fn tick(&mut self, reading: Option<Reading>) -> Result<Option<StepRecord>> {
        let Some(reading) = reading else {
            info!("no EA15 reading this tick");
            return Ok(None);
        };
        if !reading.valid {
            warn!("ignoring invalid reading: {}", reading);
            return Ok(None);
        }

        let t1 = reading.t1.c();
        let t2 = reading.t2.c();
        let t0 = *self.t0.get_or_insert(reading.timestamp);
        let elapsed = (reading.timestamp - t0).num_milliseconds() as f64 / 1000.0;

        let applied = self.output;
        self.supply.apply(Drive::from_output(applied)).await?;

        let channels = [
            self.supply.measure(1).await?,
            self.supply.measure(2).await?,
            self.supply.measure(3).await?,
        ];
        let total_current = channels[0].amps + channels[1].amps;
        let total_power = channels[0].watts + channels[1].watts;

        let Some(step) = self.pid.step(t1, reading.timestamp) else {
            return Ok(None);
        };
        self.output = step.output;

        Ok(Some(StepRecord {
            elapsed,
            target: self.pid.target(),
            gains: self.config.gains(),
            t1,
            t2,
            pid: step,
            channels,
            total_current,
            total_power,
            delta_t: (t1 - t2).abs(),
            efficiency: pid::efficiency(t1, t2, total_power),
            applied,
        }))
    }

    /// Operator edit: new target and gains, persisted immediately.
    pub fn update_config(&mut self, config: PidConfig) -> Result<()> {
        self.config = config;
        self.pid.set_target(config.target);
        self.pid.set_gains(config.gains());
        config.save(&self.config_path)?;
        info!(
            "target {:.2}C kp {} ki {} kd {} saved to {}",
            config.target,
            config.kp,
            config.ki,
            config.kd,
            self.config_path.display()
        );
        Ok(())
    }

    pub fn reset_integral(&mut self) {
        self.pid.reset_integral();
        info!("integral term reset");
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.supply.shutdown().await
    }
}

impl StepRecord {
    pub fn summary(&self) -> String {
        let ch = &self.channels;
        [
            format!("t:{:.02}s", self.elapsed),
            format!("err:{:.01}C", self.pid.err),
            format!("term_p:{:.04}A", self.pid.term_p),
            format!("term_i:{:.04}A", self.pid.term_i),
            format!("term_d:{:.04}A", self.pid.term_d),
            format!("v1:{:.03}V", ch[0].volts),
            format!("v2:{:.03}V", ch[1].volts),
            format!("v3:{:.03}V", ch[2].volts),
            format!("i1:{:.03}A", ch[0].amps),
            format!("i2:{:.03}A", ch[1].amps),
            format!("i3:{:.03}A", ch[2].amps),
            format!("p1:{:.03}W", ch[0].watts),
            format!("p2:{:.03}W", ch[1].watts),
            format!("p3:{:.03}W", ch[2].watts),
            format!("target:{:.01}C", self.target),
            format!("kp:{}", self.gains.kp),
            format!("ki:{}", self.gains.ki),
            format!("kd:{}", self.gains.kd),
            format!("t1:{:.01}C", self.t1),
            format!("t2:{:.01}C", self.t2),
            format!("delta_t:{:.01}C", self.delta_t),
            format!("total_w:{:.01}W", self.total_power),
            format!("delta_eff:{:.01}C/W", self.efficiency),
            format!("total_i:{:.02}A", self.total_current),
            format!("applied_i:{:.02}A", self.applied),
            format!("pid_i_raw:{:.02}A", self.pid.raw),
            format!("pid_i:{:.02}A", self.pid.output),
            format!("p_err:{:.04}C", self.pid.prev_err),
            format!("dt:{:.04}s", self.pid.dt),
        ]
        .join(", ")
    }
}
