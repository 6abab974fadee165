//! Daily trigger time arithmetic.

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};

/// The first `at` (UTC) strictly after `now`.
pub(crate) fn next_run_after(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}
