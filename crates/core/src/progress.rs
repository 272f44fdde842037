//! Progress percentage helpers.
//!
//! Work functions and execution contexts report progress as a whole-number
//! percentage. These helpers keep the conversion and clamping rules in one
//! place.

/// Convert a step counter into a whole-number percentage.
///
/// Returns 0 when `max` is 0 (a stream of unknown length reports no
/// meaningful percentage).
pub fn percent_from_ratio(value: u64, max: u64) -> i16 {
    if max == 0 {
        return 0;
    }
    let pct = (value as f64 / max as f64) * 100.0;
    clamp_percent(pct.round() as i16)
}

/// Clamp a reported percentage into `0..=100`.
///
/// Handlers are untrusted with respect to progress values; out-of-range
/// reports are clamped rather than rejected.
pub fn clamp_percent(pct: i16) -> i16 {
    pct.clamp(0, 100)
}
