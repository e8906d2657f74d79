//! Persistence trait for all gatepass state.
//!
//! The lifecycle, gate and scheduler components operate exclusively through
//! this trait, enabling pluggable backends (MemoryStore for tests and local
//! development, Postgres for production).
//!
//! Transitions are conditional updates: the method takes the expected prior
//! status and reports whether a row was affected. Zero rows is a normal
//! `false`, never an error here; the caller turns it into a state conflict.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::model::*;
use crate::status::{PassCategory, RequestStatus, StudentCategory};

/// Replacement fields for an in-place edit of a pending request.
#[derive(Debug, Clone)]
pub struct RequestEdit {
    pub category: PassCategory,
    pub reason: String,
    pub departure_at: DateTime<Utc>,
    pub return_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PassStore: Send + Sync {
    // ── Students & directory ──

    async fn student(&self, id: Uuid) -> Result<Option<StudentRow>>;
    async fn update_trust_score(&self, id: Uuid, score: i32) -> Result<()>;
    async fn set_pass_block(&self, id: Uuid, blocked: bool) -> Result<()>;
    async fn set_cooldown_override(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn department_head(&self, department_id: Uuid) -> Result<Option<Uuid>>;
    async fn hostel_warden(&self, hostel_id: Uuid) -> Result<Option<Uuid>>;
    async fn has_active_restriction(&self, student: &StudentRow, on: NaiveDate) -> Result<bool>;

    // ── Requests ──

    async fn insert_request(&self, row: &RequestRow) -> Result<()>;
    async fn request(&self, id: Uuid) -> Result<Option<RequestRow>>;
    async fn request_by_token(&self, token: &str) -> Result<Option<RequestRow>>;
    /// The student's single outstanding (non-terminal) request, if any.
    async fn open_request_for(&self, student_id: Uuid) -> Result<Option<RequestRow>>;
    async fn requests_in_status(&self, statuses: &[RequestStatus]) -> Result<Vec<RequestRow>>;

    /// Guarded status transition. Applies only while the row still holds
    /// `expected`; optionally sets the verification token. Returns whether
    /// a row was affected.
    async fn transition_request(
        &self,
        id: Uuid,
        expected: RequestStatus,
        next: RequestStatus,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Guarded in-place edit, valid only while the row still holds
    /// `expected`.
    async fn update_request_fields(
        &self,
        id: Uuid,
        expected: RequestStatus,
        edit: &RequestEdit,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn set_forwarded_to(&self, id: Uuid, forwarded_to: Option<Uuid>) -> Result<()>;

    async fn count_cancellations_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64>;
    async fn count_requests_between(
        &self,
        student_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64>;

    // ── Expiry sweeps (bulk transition, returning the swept rows) ──

    /// Sweep (a): any pre-exit request whose return time has passed moves
    /// to expired.
    async fn expire_past_return(&self, now: DateTime<Utc>) -> Result<Vec<RequestRow>>;
    /// Sweep (b): any gate-ready request with no exit log whose departure
    /// is older than `cutoff` moves to expired.
    async fn expire_stale_ready(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestRow>>;

    // ── Gate log (append-only) ──

    async fn latest_gate_log(&self, request_id: Uuid) -> Result<Option<GateLogRow>>;
    async fn gate_logs(&self, request_id: Uuid) -> Result<Vec<GateLogRow>>;
    async fn append_gate_log(&self, row: &GateLogRow) -> Result<()>;

    // ── Policy & calendar ──

    async fn policy(
        &self,
        student: StudentCategory,
        pass: PassCategory,
    ) -> Result<Option<PolicyRow>>;
    async fn is_calendar_exception(&self, date: NaiveDate) -> Result<bool>;

    // ── Leave & delegation ──

    async fn on_approved_leave(&self, actor_id: Uuid, on: NaiveDate) -> Result<bool>;
    async fn active_delegation_for(
        &self,
        authority_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegationRow>>;
    /// True when `actor` holds an in-force grant from `authority`.
    async fn is_delegate_of(
        &self,
        actor_id: Uuid,
        authority_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Activate a grant; any prior active grant for the same authority is
    /// deactivated in the same step.
    async fn activate_delegation(&self, row: &DelegationRow) -> Result<()>;

    // ── Trust audit (append-only) ──

    async fn append_trust_adjustment(&self, row: &TrustAdjustmentRow) -> Result<()>;
    async fn trust_history(&self, student_id: Uuid) -> Result<Vec<TrustAdjustmentRow>>;
}
