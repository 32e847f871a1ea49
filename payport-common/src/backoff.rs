use std::{cmp::min, time::Duration};

const EXP_BASE: u64 = 2;

/// Get an iterator of [`Duration`]s which can be passed into e.g.
/// [`tokio::time::sleep`] to observe time-based exponential (base 2)
/// backoff, starting at `initial` and capped at `maximum`.
///
/// The entitlement grant retry loop uses `iter_with(1s, 4s)` to observe its
/// 1s -> 2s -> 4s contract.
pub fn iter_with(
    initial: Duration,
    maximum: Duration,
) -> impl Iterator<Item = Duration> {
    let initial_ms = initial.as_millis() as u64;
    let maximum_ms = maximum.as_millis() as u64;
    (0u32..).map(move |index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = initial_ms.saturating_mul(factor);
        Duration::from_millis(min(wait_ms, maximum_ms))
    })
}
