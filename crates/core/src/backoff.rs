//! Retry delay policy for transient submission failures.

use std::time::Duration;

/// Linear backoff: the delay after the `failed_attempt`-th failure
/// (1-based) is `base * failed_attempt`.
///
/// With the default 2s base this waits 2s, 4s, 6s, ... between attempts.
pub fn linear_backoff(base: Duration, failed_attempt: u32) -> Duration {
    base.saturating_mul(failed_attempt.max(1))
}
