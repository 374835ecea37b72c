//! Margin arithmetic for shaping limits.
//!
//! The max-limit handed to the router is the attainable rate minus a fixed
//! headroom fraction, so the shaping queue (CAKE / fq_codel) stays the
//! bottleneck instead of the DSL line itself.

/// Compute the shaping limit for a measured rate.
///
/// Rounding policy is floor: the limit must never exceed the margined rate.
/// `margin` is validated at config load to be in `[0, 1)`.
pub fn compute_limit(rate_bits: u64, margin: f64) -> u64 {
    debug_assert!((0.0..1.0).contains(&margin));
    (rate_bits as f64 * (1.0 - margin)).floor() as u64
}

/// Convert bits per second to kilobits per second, rounded to two decimals.
/// Used only for the audit log lines.
pub fn bits_to_kbps(bits: u64) -> f64 {
    (bits as f64 / 10.0).round() / 100.0
}
