use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};
use crate::pid::PidGains;

/// Operator-tunable loop parameters, persisted as `target kp ki kd` on one
/// line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidConfig {
    pub target: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            target: 22.5,
            kp: 2.0,
            ki: 0.002,
            kd: 0.5,
        }
    }
}

impl PidConfig {
    pub fn gains(&self) -> PidGains {
        PidGains {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let values = text
            .split_whitespace()
            .map(|s| s.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Config(e.to_string()))?;

        match values.as_slice() {
            &[target, kp, ki, kd] => Ok(Self { target, kp, ki, kd }),
            _ => Err(Error::Config(format!("expected 4 values, found {}", values.len()))),
        }
    }

    /// Loads `path`, falling back to the defaults when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(
            path,
            format!("{} {} {} {}\n", self.target, self.kp, self.ki, self.kd),
        )?;
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = home::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
