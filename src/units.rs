//! Physical quantities with SI prefixes.
//!
//! Measurement parameters arrive either as bare numbers or as strings such as
//! `"1000 mV"` or `"100 ms"`. `Quantity::parse` splits magnitude, prefix and base unit;
//! `Quantity::to` converts into another unit of the same dimension.

use once_cell::sync::Lazy;
use regex::Regex;

static QUANTITY_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*([A-Za-zµ%]*)\s*$").ok()
});

/// Base units known to the parser.
const BASE_UNITS: &[&str] = &["V", "A", "s", "Hz", "F", "Ohm", "m", "degC", "%", "1"];

/// A magnitude expressed in a base unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    /// Magnitude in the base unit (prefix already applied)
    pub magnitude: f64,
    /// Base unit symbol
    pub unit: &'static str,
}

fn prefix_factor(prefix: &str) -> Option<f64> {
    Some(match prefix {
        "" => 1.0,
        "f" => 1e-15,
        "p" => 1e-12,
        "n" => 1e-9,
        "u" | "µ" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        _ => return None,
    })
}

/// Split a unit symbol like `mV` into prefix factor and base unit.
///
/// Exact base-unit matches win so `m` (metre) is not read as the milli prefix.
pub fn split_unit(symbol: &str) -> Option<(f64, &'static str)> {
    let symbol = match symbol {
        "" => "1",
        "ohm" => "Ohm",
        other => other,
    };
    if let Some(base) = BASE_UNITS.iter().find(|b| **b == symbol) {
        return Some((1.0, base));
    }
    BASE_UNITS.iter().find_map(|base| {
        symbol
            .strip_suffix(base)
            .and_then(prefix_factor)
            .map(|factor| (factor, *base))
    })
}

impl Quantity {
    /// Parse `"<magnitude> <unit>"`. A missing unit yields a dimensionless quantity.
    pub fn parse(text: &str) -> Option<Self> {
        let re = QUANTITY_RE.as_ref()?;
        let caps = re.captures(text)?;
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let (factor, unit) = split_unit(caps.get(2).map_or("", |m| m.as_str()))?;
        Some(Self {
            magnitude: value * factor,
            unit,
        })
    }

    /// Convert to `target` (which may carry a prefix). Returns `None` on dimension mismatch.
    pub fn to(&self, target: &str) -> Option<f64> {
        let (factor, unit) = split_unit(target)?;
        (unit == self.unit).then(|| self.magnitude / factor)
    }
}

/// Format a value with an SI prefix, e.g. `2.500 mV`.
pub fn format_metric(value: f64, unit: &str) -> String {
    if !value.is_finite() || value == 0.0 {
        return format!("{value:.3} {unit}");
    }
    let prefixes = [
        (1e9, "G"),
        (1e6, "M"),
        (1e3, "k"),
        (1.0, ""),
        (1e-3, "m"),
        (1e-6, "u"),
        (1e-9, "n"),
        (1e-12, "p"),
        (1e-15, "f"),
    ];
    let abs = value.abs();
    let (scale, prefix) = prefixes
        .iter()
        .copied()
        .find(|(scale, _)| abs >= *scale)
        .unwrap_or((1e-15, "f"));
    format!("{:.3} {}{}", value / scale, prefix, unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millivolts_to_volts() {
        let q = Quantity::parse("1000 mV").unwrap();
        assert!((q.to("V").unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn incompatible_dimension() {
        let q = Quantity::parse("1 kHz").unwrap();
        assert_eq!(q.to("V"), None);
        assert_eq!(q.to("Hz"), Some(1000.0));
    }

    #[test]
    fn metre_is_not_milli() {
        let q = Quantity::parse("5 m").unwrap();
        assert_eq!(q.unit, "m");
        assert_eq!(q.magnitude, 5.0);
        let q = Quantity::parse("2 um").unwrap();
        assert!((q.to("m").unwrap() - 2e-6).abs() < 1e-18);
    }

    #[test]
    fn parse_variants() {
        assert_eq!(Quantity::parse("100ms").unwrap().to("s"), Some(0.1));
        assert_eq!(Quantity::parse("-1e-6 A").unwrap().to("uA"), Some(-1.0));
        assert_eq!(Quantity::parse("10 Ohm").unwrap().unit, "Ohm");
        assert!(Quantity::parse("ten volts").is_none());
        assert!(Quantity::parse("1 xV").is_none());
    }

    #[test]
    fn metric_formatting() {
        assert_eq!(format_metric(0.0025, "V"), "2.500 mV");
        assert_eq!(format_metric(-12.0, "V"), "-12.000 V");
        assert_eq!(format_metric(1.5e-12, "F"), "1.500 pF");
    }
}
