//! Monetary rounding helpers.
//!
//! Report amounts travel as plain JSON numbers, so they are `f64` end to end.
//! Rounding happens exactly once, at the end of an aggregation, never on
//! intermediate sums.

/// Round to 2 fractional digits, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
