//! Minimal Kubernetes quantity parsing (`500m`, `1.5`, `128Mi`, `10G`, `1e3`).
//!
//! Values are returned in base units (cores for cpu, bytes for memory/storage).
//! Precision is f64; good enough for ordering requests against limits and
//! claim sizes against each other.

use std::cmp::Ordering;

/// Parse a quantity string into base units. Returns `None` for malformed input.
pub fn parse(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() { return None; }
    let split = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '+' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    if num.is_empty() { return None; }
    let value: f64 = num.parse().ok()?;
    if value < 0.0 { return None; }
    let factor = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let e: i32 = exp[1..].parse().ok()?;
            10f64.powi(e)
        }
        _ => return None,
    };
    Some(value * factor)
}

pub fn is_valid(raw: &str) -> bool {
    parse(raw).is_some()
}

/// Order two quantities; `None` when either side does not parse.
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    let (a, b) = (parse(a)?, parse(b)?);
    a.partial_cmp(&b)
}

/// The smaller of two quantities, preferring `preferred` when they cannot be compared.
pub fn min<'a>(preferred: &'a str, other: &'a str) -> &'a str {
    match compare(preferred, other) {
        Some(Ordering::Greater) => other,
        _ => preferred,
    }
}
