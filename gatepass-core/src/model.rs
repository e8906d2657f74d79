//! Data Model
//!
//! Row types shared by both store backends. Requests are never deleted,
//! only transitioned; gate logs and trust adjustments are append-only.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{
    GateActionKind, GateEvent, HolidayBehavior, PassCategory, RequestStatus, StudentCategory,
};

/// One leave/outing attempt. At most one non-terminal row per student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRow {
    pub request_id: Uuid,
    pub student_id: Uuid,
    pub category: PassCategory,
    pub reason: String,
    pub departure_at: DateTime<Utc>,
    /// Auto-filled to end-of-day at creation when the category allows an
    /// open-ended return.
    pub return_at: Option<DateTime<Utc>>,
    pub status: RequestStatus,
    /// Delegated-approver override: who the item was routed to when the
    /// assigned authority was unavailable.
    pub forwarded_to: Option<Uuid>,
    /// Opaque token issued at final approval, presented at the gate.
    pub verify_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Student/actor record. Score is owned by the trust ledger; the block
/// flag by approving authorities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentRow {
    pub student_id: Uuid,
    pub name: String,
    pub category: StudentCategory,
    pub active: bool,
    pub trust_score: i32,
    pub pass_blocked: bool,
    /// Cancellation history before this instant does not count toward the
    /// cooldown.
    pub cooldown_override_at: Option<DateTime<Utc>>,
    pub year_of_study: i16,
    pub mentor_id: Uuid,
    pub department_id: Uuid,
    pub hostel_id: Option<Uuid>,
}

/// Append-only record of a physical gate action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateLogRow {
    pub log_id: Uuid,
    pub request_id: Uuid,
    pub action: GateEvent,
    pub gatekeeper_id: Uuid,
    pub logged_at: DateTime<Utc>,
}

/// Staff leave window, consulted only at authority-resolution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRecordRow {
    pub leave_id: Uuid,
    pub actor_id: Uuid,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub approved: bool,
}

impl LeaveRecordRow {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.approved && self.starts_on <= date && date <= self.ends_on
    }
}

/// Time-bounded grant of one authority's full stage-2 power to a delegate.
/// At most one active grant per delegating authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRow {
    pub delegation_id: Uuid,
    pub authority_id: Uuid,
    pub delegate_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub active: bool,
}

impl DelegationRow {
    pub fn in_force(&self, at: DateTime<Utc>) -> bool {
        self.active && self.starts_at <= at && at < self.ends_at
    }
}

/// Configured rule for one (student category, pass category) pairing.
/// Hours are local wall-clock hours; `None` window bounds mean
/// unrestricted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRow {
    pub student_category: StudentCategory,
    pub pass_category: PassCategory,
    pub window_start_hour: Option<u32>,
    pub window_end_hour: Option<u32>,
    pub holiday_behavior: HolidayBehavior,
    pub holiday_start_hour: Option<u32>,
    pub holiday_end_hour: Option<u32>,
    pub max_duration_hours: Option<i64>,
    pub gate_action: GateActionKind,
}

/// Append-only audit row for every trust score change. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAdjustmentRow {
    pub adjustment_id: Uuid,
    pub student_id: Uuid,
    /// Actor id as text, or "system" for rule-driven adjustments.
    pub adjusted_by: String,
    pub old_score: i32,
    pub new_score: i32,
    pub delta: i32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Department- or year-wide request freeze, managed externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictionRow {
    pub restriction_id: Uuid,
    pub department_id: Option<Uuid>,
    pub year_of_study: Option<i16>,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub reason: String,
}

impl RestrictionRow {
    /// Whether this restriction applies to the given student on a date.
    pub fn applies_to(&self, student: &StudentRow, on: NaiveDate) -> bool {
        if on < self.starts_on || on > self.ends_on {
            return false;
        }
        let dept_hit = self
            .department_id
            .map(|d| d == student.department_id)
            .unwrap_or(true);
        let year_hit = self
            .year_of_study
            .map(|y| y == student.year_of_study)
            .unwrap_or(true);
        dept_hit && year_hit
    }
}
