//! Pass Policy Engine
//!
//! Decides whether a departure is permitted for a (student category, pass
//! category) pairing at a given instant, and which physical gate action the
//! pass will require. The calendar and the policy table live in the store;
//! the decision itself is a pure function, tested without a backend.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::GatepassConfig;
use crate::error::PassError;
use crate::fallback::default_policy;
use crate::model::PolicyRow;
use crate::status::{GateActionKind, HolidayBehavior, PassCategory, StudentCategory};
use crate::store::PassStore;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub gate_action: GateActionKind,
}

impl PolicyDecision {
    fn denied(reason: impl Into<String>, gate_action: GateActionKind) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            gate_action,
        }
    }

    fn allowed(gate_action: GateActionKind) -> Self {
        Self {
            allowed: true,
            reason: None,
            gate_action,
        }
    }
}

pub struct PolicyEngine {
    store: Arc<dyn PassStore>,
    config: GatepassConfig,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn PassStore>, config: GatepassConfig) -> Self {
        Self { store, config }
    }

    /// Evaluate a departure against the configured policy, falling back to
    /// the legacy defaults when no row matches.
    pub async fn evaluate(
        &self,
        student: StudentCategory,
        pass: PassCategory,
        departure: DateTime<Utc>,
        duration: Duration,
    ) -> Result<PolicyDecision, PassError> {
        let policy = self.lookup(student, pass).await?;
        let holiday = self.is_holiday(departure).await?;
        Ok(check(&policy, holiday, departure, duration))
    }

    /// The gate action a pass of this pairing requires, without time checks.
    pub async fn required_gate_action(
        &self,
        student: StudentCategory,
        pass: PassCategory,
    ) -> Result<GateActionKind, PassError> {
        Ok(self.lookup(student, pass).await?.gate_action)
    }

    async fn lookup(
        &self,
        student: StudentCategory,
        pass: PassCategory,
    ) -> Result<PolicyRow, PassError> {
        let row = self.store.policy(student, pass).await?;
        Ok(row.unwrap_or_else(|| default_policy(student, pass)))
    }

    /// A date is a holiday when flagged in the calendar-exceptions table or
    /// when it falls on a configured weekly rest day.
    pub async fn is_holiday(&self, at: DateTime<Utc>) -> Result<bool, PassError> {
        if self.config.rest_days.contains(&at.weekday()) {
            return Ok(true);
        }
        Ok(self.store.is_calendar_exception(at.date_naive()).await?)
    }
}

/// The pure decision: window checks and the duration cap. Timestamps are
/// campus-local wall clock.
pub fn check(
    policy: &PolicyRow,
    holiday: bool,
    departure: DateTime<Utc>,
    duration: Duration,
) -> PolicyDecision {
    let hour = departure.hour();

    if holiday {
        match policy.holiday_behavior {
            HolidayBehavior::Block => {
                return PolicyDecision::denied(
                    format!("{} passes are not issued on holidays", policy.pass_category),
                    policy.gate_action,
                );
            }
            HolidayBehavior::CustomWindow => {
                if !inside(hour, policy.holiday_start_hour, policy.holiday_end_hour) {
                    return PolicyDecision::denied(
                        window_message("holiday", policy.holiday_start_hour, policy.holiday_end_hour),
                        policy.gate_action,
                    );
                }
            }
            HolidayBehavior::Unrestricted => {}
        }
    } else if !inside(hour, policy.window_start_hour, policy.window_end_hour) {
        return PolicyDecision::denied(
            window_message("working-hours", policy.window_start_hour, policy.window_end_hour),
            policy.gate_action,
        );
    }

    if let Some(max_hours) = policy.max_duration_hours {
        if duration > Duration::hours(max_hours) {
            return PolicyDecision::denied(
                format!("duration exceeds the {max_hours}h cap for this pass"),
                policy.gate_action,
            );
        }
    }

    PolicyDecision::allowed(policy.gate_action)
}

/// Absence of a window means unrestricted; a window requires both bounds.
fn inside(hour: u32, start: Option<u32>, end: Option<u32>) -> bool {
    match (start, end) {
        (Some(s), Some(e)) => hour >= s && hour < e,
        _ => true,
    }
}

fn window_message(kind: &str, start: Option<u32>, end: Option<u32>) -> String {
    match (start, end) {
        (Some(s), Some(e)) => format!("departure falls outside the {kind} window {s:02}:00-{e:02}:00"),
        _ => format!("departure falls outside the {kind} window"),
    }
}
