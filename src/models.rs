use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

const KELVIN_OFFSET: f64 = 273.15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TempUnit {
    C,
    F,
    K,
}

impl TempUnit {
    /// Unit code carried in the low 7 bits of a packet's unit/sign byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::C),
            2 => Some(Self::K),
            3 => Some(Self::F),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::C => 'C',
            Self::F => 'F',
            Self::K => 'K',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SensorType {
    K,
    J,
    E,
    T,
    R,
    S,
    N,
}

impl SensorType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::K),
            1 => Some(Self::J),
            2 => Some(Self::E),
            3 => Some(Self::T),
            4 => Some(Self::R),
            5 => Some(Self::S),
            6 => Some(Self::N),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A temperature held internally in Celsius.
///
/// An unsupported unit leaves the value at 0.0 with `valid` cleared; callers
/// must check [`Temperature::is_valid`] before trusting the reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Temperature {
    celsius: f64,
    valid: bool,
}

impl Temperature {
    pub fn new(value: f64, unit: char) -> Self {
        let mut t = Self::default();
        t.set(value, unit);
        t
    }

    pub fn from_unit(value: f64, unit: TempUnit) -> Self {
        Self::new(value, unit.as_char())
    }

    pub fn set(&mut self, value: f64, unit: char) {
        self.valid = true;
        match unit {
            'C' => self.celsius = value,
            'F' => self.celsius = f2c(value),
            'K' => self.celsius = k2c(value),
            _ => {
                self.celsius = 0.0;
                self.valid = false;
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn c(&self) -> f64 {
        self.celsius
    }

    pub fn f(&self) -> f64 {
        c2f(self.celsius)
    }

    pub fn k(&self) -> f64 {
        c2k(self.celsius)
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.02}C", self.celsius)
    }
}

pub fn f2c(v: f64) -> f64 {
    (v - 32.0) * (5.0 / 9.0)
}

pub fn c2f(v: f64) -> f64 {
    v * (9.0 / 5.0) + 32.0
}

pub fn k2c(v: f64) -> f64 {
    v - KELVIN_OFFSET
}

pub fn c2k(v: f64) -> f64 {
    v + KELVIN_OFFSET
}

/// One decoded live-measurement packet from the EA15.
#[derive(Debug, Clone, Serialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub t1: Temperature,
    pub t1_unit: Option<TempUnit>,
    pub t2: Temperature,
    pub t2_unit: Option<TempUnit>,
    pub sensor: Option<SensorType>,
    pub valid: bool,
}

impl Reading {
    pub fn invalid(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            t1: Temperature::default(),
            t1_unit: None,
            t2: Temperature::default(),
            t2_unit: None,
            sensor: None,
            valid: false,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sensor = self.sensor.map(|s| s.to_string()).unwrap_or_default();
        write!(
            f,
            "{} : {} : {} : {} : {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.t1,
            self.t2,
            sensor,
            self.valid
        )
    }
}

/// One contiguous logging run stored in the meter's memory.
#[derive(Debug, Clone, Serialize)]
pub struct DatalogSession {
    /// Interval-selection code sent with the session marker.
    pub interval: u8,
    pub readings: Vec<Reading>,
}
