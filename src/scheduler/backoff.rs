use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Delay before the retry following failed attempt `attempt_no` (1-based).
///
/// `base * growth_factor^(attempt_no - 1)`, capped at `max_backoff`, with
/// `jitter_ratio` of random spread so many tasks of the same job do not
/// retry in lockstep.
pub fn delay_for_attempt(policy: &RetryPolicy, attempt_no: u32) -> Duration {
    let exponent = attempt_no.saturating_sub(1).min(30);
    let raw = policy.base_backoff.as_millis() as f64 * policy.growth_factor.powi(exponent as i32);
    let capped = raw.min(policy.max_backoff.as_millis() as f64);

    let jittered = if policy.jitter_ratio > 0.0 {
        let spread = capped * policy.jitter_ratio;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        (capped + offset).max(0.0)
    } else {
        capped
    };

    Duration::from_millis(jittered as u64)
}
