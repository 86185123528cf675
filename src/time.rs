//! Wall-clock helpers and the aligned flush ticker arithmetic.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Gets the current Unix timestamp, in seconds.
pub fn get_unix_timestamp() -> u64 {
    unix_now().as_secs()
}

/// Gets the time since the Unix epoch, at full precision.
pub fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Computes the delay until the next wall-clock instant that is an integer
/// multiple of `period`, measured from the Unix epoch.
///
/// An instant exactly on a multiple yields a full period, so consecutive
/// fires are always one period apart. Recomputing after every fire
/// re-aligns the ticker and coalesces missed fires.
pub fn next_aligned_delay(now: Duration, period: Duration) -> Duration {
    let period_ns = period.as_nanos();
    let remainder = now.as_nanos() % period_ns;
    Duration::from_nanos((period_ns - remainder) as u64)
}

/// Sleeps until the next aligned fire of a ticker with the given period.
pub fn aligned_sleep(period: Duration) -> tokio::time::Sleep {
    tokio::time::sleep(next_aligned_delay(unix_now(), period))
}
