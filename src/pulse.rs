//! Pulse-id alignment arithmetic for subsampled beam rates.
//!
//! The timing system issues pulse ids at 100 Hz; a rate multiplier `k`
//! selects the beam-aligned subset `{p : p mod k == 0}`. Acquisition
//! windows are widened so that aligned boundary pulses sit strictly inside
//! the half-open range handed to the dispatching layer.

/// Widen `[start, stop]` so that beam-aligned endpoints fall strictly inside.
///
/// An endpoint that happens to be aligned (`p mod k == 0`) is moved out by
/// one pulse; non-aligned endpoints are kept as-is.
pub fn expand(start: u64, stop: u64, rate_multiplicator: u64) -> (u64, u64) {
    let k = rate_multiplicator.max(1);

    let start = if start % k == 0 { start.saturating_sub(1) } else { start };
    let stop = if stop % k == 0 { stop + 1 } else { stop };

    (start, stop)
}

/// All beam-aligned pulse ids in the closed range `[start, stop]`, ascending.
pub fn enumerate_aligned(start: u64, stop: u64, rate_multiplicator: u64) -> Vec<u64> {
    let k = rate_multiplicator.max(1);

    if start > stop {
        return Vec::new();
    }

    let first = start.div_ceil(k) * k;
    (first..=stop).step_by(k as usize).collect()
}

/// First and last aligned pulse in `[start, stop]`, if the range contains any.
pub fn aligned_bounds(start: u64, stop: u64, rate_multiplicator: u64) -> Option<(u64, u64)> {
    let k = rate_multiplicator.max(1);

    let first = start.div_ceil(k) * k;
    if first > stop {
        return None;
    }
    let last = stop / k * k;

    Some((first, last))
}
