//! Physical units and order-of-magnitude prefixes attached to every reading and metric.
//!
//! Values are stored in the magnitude their source reported them in; rescaling only happens
//! when two quantities of different magnitude have to be combined or displayed.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Unit {
    Joule,
    Watt,
    Byte,
    Second,
    Percent,
    Hertz,
    /// Dimensionless, e.g. cost or counts
    Scalar,
    /// Mass of CO2 equivalent
    Gram,
}

impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Joule => "J",
            Unit::Watt => "W",
            Unit::Byte => "B",
            Unit::Second => "s",
            Unit::Percent => "%",
            Unit::Hertz => "Hz",
            Unit::Scalar => "",
            Unit::Gram => "g",
        }
    }

    pub fn from_symbol(s: &str) -> Option<Self> {
        Some(match s {
            "J" => Unit::Joule,
            "W" => Unit::Watt,
            "B" => Unit::Byte,
            "s" => Unit::Second,
            "%" => Unit::Percent,
            "Hz" => Unit::Hertz,
            "" => Unit::Scalar,
            "g" => Unit::Gram,
            _ => return None,
        })
    }
}
impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Magnitude {
    Pico,
    Nano,
    Micro,
    Milli,
    #[default]
    One,
    Kilo,
    Mega,
    Giga,
    Tera,
}

impl Magnitude {
    /// Power of ten this prefix represents.
    pub fn exponent(&self) -> i32 {
        match self {
            Magnitude::Pico => -12,
            Magnitude::Nano => -9,
            Magnitude::Micro => -6,
            Magnitude::Milli => -3,
            Magnitude::One => 0,
            Magnitude::Kilo => 3,
            Magnitude::Mega => 6,
            Magnitude::Giga => 9,
            Magnitude::Tera => 12,
        }
    }

    /// Multiplier to convert a value in this magnitude to base units.
    pub fn factor(&self) -> f64 {
        10f64.powi(self.exponent())
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Magnitude::Pico => "p",
            Magnitude::Nano => "n",
            Magnitude::Micro => "u",
            Magnitude::Milli => "m",
            Magnitude::One => "",
            Magnitude::Kilo => "k",
            Magnitude::Mega => "M",
            Magnitude::Giga => "G",
            Magnitude::Tera => "T",
        }
    }

    pub fn from_prefix(s: &str) -> Option<Self> {
        Some(match s {
            "p" => Magnitude::Pico,
            "n" => Magnitude::Nano,
            "u" => Magnitude::Micro,
            "m" => Magnitude::Milli,
            "" => Magnitude::One,
            "k" => Magnitude::Kilo,
            "M" => Magnitude::Mega,
            "G" => Magnitude::Giga,
            "T" => Magnitude::Tera,
            _ => return None,
        })
    }

    /// Largest prefix that keeps `base_value` at or above 1, for display.
    pub fn best_fit(base_value: f64) -> Self {
        let abs = base_value.abs();
        if abs == 0.0 || !abs.is_finite() {
            return Magnitude::One;
        }
        ALL_MAGNITUDES
            .iter()
            .rev()
            .find(|m| abs >= m.factor())
            .copied()
            .unwrap_or(Magnitude::Pico)
    }
}

const ALL_MAGNITUDES: [Magnitude; 9] = [
    Magnitude::Pico,
    Magnitude::Nano,
    Magnitude::Micro,
    Magnitude::Milli,
    Magnitude::One,
    Magnitude::Kilo,
    Magnitude::Mega,
    Magnitude::Giga,
    Magnitude::Tera,
];

/// An exactly-representable numeric value.
/// Raw hardware counters stay integers so they survive persistence without rounding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(u64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Number::Int(i) => Some(*i),
            Number::Float(_) => None,
        }
    }

    /// Parse the textual form produced by [Display]; integers are preferred.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        if let Ok(i) = s.parse::<u64>() {
            return Ok(Number::Int(i));
        }
        match s.parse::<f64>() {
            Ok(f) => Ok(Number::Float(f)),
            Err(e) => anyhow::bail!("'{}' is not a number: {}", s, e),
        }
    }
}
impl From<u64> for Number {
    fn from(v: u64) -> Self {
        Number::Int(v)
    }
}
impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::Float(v)
    }
}
impl Display for Number {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            // `{:?}` keeps the shortest representation that parses back to the same bits
            Number::Float(v) => write!(f, "{:?}", v),
        }
    }
}

/// Format `value` (given in `mag`) for humans, picking a readable prefix.
pub fn pretty(value: f64, unit: Unit, mag: Magnitude) -> String {
    let base = value * mag.factor();
    let fit = Magnitude::best_fit(base);
    format!("{:.3} {}{}", base / fit.factor(), fit.prefix(), unit.symbol())
}
