//! Runtime Configuration
//!
//! Every tunable threshold lives here so deployments can adjust policy
//! buffers without a rebuild. `from_env` reads `GATEPASS_*` variables over
//! the documented defaults; anything unset or unparsable keeps its default.

use chrono::Weekday;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct GatepassConfig {
    /// Furthest ahead a departure may be scheduled, in days.
    pub max_advance_days: i64,
    /// Grace for departures slightly in the past at creation time, minutes.
    pub creation_grace_minutes: i64,
    /// A pending request is editable only while departure is further away
    /// than this, in hours.
    pub edit_lock_hours: i64,
    /// Minimum trust score to submit a request.
    pub min_trust_to_create: i32,
    /// Minimum trust score for resident stage-3 verification.
    pub min_trust_to_verify: i32,
    /// Rolling window for the cancellation cooldown, hours.
    pub cooldown_window_hours: i64,
    /// Cancellations inside the window that trip the cooldown.
    pub cooldown_cancel_limit: i64,
    /// Trust deduction for cancelling after stage-2/3 approval.
    pub late_cancel_penalty: i32,
    /// Requests per calendar month before the volume penalty applies.
    pub monthly_request_threshold: i64,
    /// Trust deduction for each request at or past the monthly threshold.
    pub monthly_excess_penalty: i32,
    /// Grace past scheduled departure before a late-departure flag, minutes.
    pub departure_grace_minutes: i64,
    /// Departure grace for the emergency category, hours.
    pub emergency_grace_hours: i64,
    /// Exit before this buffer ahead of departure is flagged "too early",
    /// hours.
    pub early_departure_hours: i64,
    /// A gate-ready pass with no exit this long after departure is swept to
    /// expired, hours.
    pub stale_departure_hours: i64,
    /// Base interval between scheduler sweeps, seconds.
    pub sweep_interval_secs: u64,
    /// Random jitter added to each sweep interval, seconds.
    pub sweep_jitter_secs: u64,
    /// Weekly rest days treated as holidays.
    pub rest_days: Vec<Weekday>,
}

impl Default for GatepassConfig {
    fn default() -> Self {
        Self {
            max_advance_days: 7,
            creation_grace_minutes: 15,
            edit_lock_hours: 2,
            min_trust_to_create: 30,
            min_trust_to_verify: 50,
            cooldown_window_hours: 24,
            cooldown_cancel_limit: 3,
            late_cancel_penalty: 5,
            monthly_request_threshold: 5,
            monthly_excess_penalty: 2,
            departure_grace_minutes: 30,
            emergency_grace_hours: 24,
            early_departure_hours: 2,
            stale_departure_hours: 2,
            sweep_interval_secs: 120,
            sweep_jitter_secs: 15,
            rest_days: vec![Weekday::Sat, Weekday::Sun],
        }
    }
}

impl GatepassConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_advance_days: env_or("GATEPASS_MAX_ADVANCE_DAYS", d.max_advance_days),
            creation_grace_minutes: env_or("GATEPASS_CREATION_GRACE_MIN", d.creation_grace_minutes),
            edit_lock_hours: env_or("GATEPASS_EDIT_LOCK_HOURS", d.edit_lock_hours),
            min_trust_to_create: env_or("GATEPASS_MIN_TRUST_CREATE", d.min_trust_to_create),
            min_trust_to_verify: env_or("GATEPASS_MIN_TRUST_VERIFY", d.min_trust_to_verify),
            cooldown_window_hours: env_or("GATEPASS_COOLDOWN_HOURS", d.cooldown_window_hours),
            cooldown_cancel_limit: env_or("GATEPASS_COOLDOWN_LIMIT", d.cooldown_cancel_limit),
            late_cancel_penalty: env_or("GATEPASS_LATE_CANCEL_PENALTY", d.late_cancel_penalty),
            monthly_request_threshold: env_or(
                "GATEPASS_MONTHLY_THRESHOLD",
                d.monthly_request_threshold,
            ),
            monthly_excess_penalty: env_or("GATEPASS_MONTHLY_PENALTY", d.monthly_excess_penalty),
            departure_grace_minutes: env_or("GATEPASS_DEPARTURE_GRACE_MIN", d.departure_grace_minutes),
            emergency_grace_hours: env_or("GATEPASS_EMERGENCY_GRACE_HOURS", d.emergency_grace_hours),
            early_departure_hours: env_or("GATEPASS_EARLY_BUFFER_HOURS", d.early_departure_hours),
            stale_departure_hours: env_or("GATEPASS_STALE_DEPARTURE_HOURS", d.stale_departure_hours),
            sweep_interval_secs: env_or("GATEPASS_SWEEP_INTERVAL_SECS", d.sweep_interval_secs),
            sweep_jitter_secs: env_or("GATEPASS_SWEEP_JITTER_SECS", d.sweep_jitter_secs),
            rest_days: rest_days_from_env().unwrap_or(d.rest_days),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `GATEPASS_REST_DAYS` as comma-separated day names ("sat,sun").
fn rest_days_from_env() -> Option<Vec<Weekday>> {
    let raw = std::env::var("GATEPASS_REST_DAYS").ok()?;
    let days: Vec<Weekday> = raw
        .split(',')
        .filter_map(|d| d.trim().parse().ok())
        .collect();
    if days.is_empty() {
        None
    } else {
        Some(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let c = GatepassConfig::default();
        assert_eq!(c.max_advance_days, 7);
        assert_eq!(c.edit_lock_hours, 2);
        assert_eq!(c.min_trust_to_create, 30);
        assert_eq!(c.min_trust_to_verify, 50);
        assert_eq!(c.cooldown_cancel_limit, 3);
        assert_eq!(c.rest_days, vec![Weekday::Sat, Weekday::Sun]);
    }
}
