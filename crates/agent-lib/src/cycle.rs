//! Elapsed-time gate shared by packaging, upload and source checks

use chrono::{DateTime, Utc};
use tracing::info;

/// Returns true when an activity gated on `cycle_minutes` is due.
///
/// `last_success` of `None` means the activity never completed, which always
/// forces a run. Elapsed time is compared in whole minutes.
pub fn should_run(cycle_minutes: i64, last_success: Option<DateTime<Utc>>, action: &str) -> bool {
    should_run_at(cycle_minutes, last_success, Utc::now(), action)
}

/// Same as [`should_run`] with an explicit clock
pub fn should_run_at(
    cycle_minutes: i64,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    action: &str,
) -> bool {
    let Some(last) = last_success else {
        info!(action = %action, "No prior successful run");
        return true;
    };

    let minutes = (now - last).num_minutes();
    if minutes >= cycle_minutes {
        info!(action = %action, minutes_since_last = minutes, "Executing");
        true
    } else {
        info!(action = %action, minutes_since_last = minutes, "Not time to execute");
        false
    }
}
