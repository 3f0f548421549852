//! Fee arithmetic. Amounts are whole currency units.

use time::Duration;

const MILLIS_PER_HOUR: i128 = 3_600_000;

/// `round(hours_elapsed * hourly_rate)`, half-up, in integer milliseconds.
/// Always recomputed from the session start, never incremented.
pub fn fee_for(elapsed: Duration, hourly_rate: i64) -> i64 {
    let millis = elapsed.whole_milliseconds().max(0);
    let rate = i128::from(hourly_rate.max(0));
    let fee = (millis * rate + MILLIS_PER_HOUR / 2) / MILLIS_PER_HOUR;
    i64::try_from(fee).unwrap_or(i64::MAX)
}

/// Whole minutes elapsed (floor).
pub fn accrued_minutes(elapsed: Duration) -> i64 {
    elapsed.whole_minutes().max(0)
}
