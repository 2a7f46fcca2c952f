//! Platform quantity strings (`500m`, `2Gi`, `1e3`).

use regex::Regex;

const PATTERN: &str = r"^([+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+))((?:[KMGTPE]i)|[numkMGTPE]|[eE][+-]?[0-9]+)?$";

/// Parses quantity strings into plain numbers so equal amounts compare equal
/// regardless of how the platform canonicalised them.
pub struct QuantityParser {
    re: Regex,
}

impl QuantityParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self { re: Regex::new(PATTERN)? })
    }

    pub fn is_valid(&self, s: &str) -> bool {
        self.re.is_match(s)
    }

    pub fn value(&self, s: &str) -> Option<f64> {
        let caps = self.re.captures(s)?;
        let number: f64 = caps.get(1)?.as_str().parse().ok()?;
        let scale = match caps.get(2).map(|m| m.as_str()) {
            None => 1.0,
            Some(suffix) => multiplier(suffix)?,
        };
        Some(number * scale)
    }

    /// Equal amounts, or byte-identical strings when either side does not parse.
    pub fn same(&self, a: &str, b: &str) -> bool {
        match (self.value(a), self.value(b)) {
            (Some(x), Some(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0),
            _ => a == b,
        }
    }
}

fn multiplier(suffix: &str) -> Option<f64> {
    let binary = |p: i32| 1024f64.powi(p);
    let decimal = |p: i32| 10f64.powi(p);
    Some(match suffix {
        "Ki" => binary(1),
        "Mi" => binary(2),
        "Gi" => binary(3),
        "Ti" => binary(4),
        "Pi" => binary(5),
        "Ei" => binary(6),
        "n" => decimal(-9),
        "u" => decimal(-6),
        "m" => decimal(-3),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        exp => decimal(exp.get(1..)?.parse().ok()?),
    })
}
