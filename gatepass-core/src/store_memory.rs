//! In-memory store backend.
//!
//! Backs the test suite and local development without a database. A single
//! `RwLock` over the whole state keeps the conditional updates atomic,
//! mirroring the row-level guarantees of the Postgres backend.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::*;
use crate::status::{GateEvent, PassCategory, RequestStatus, StudentCategory};
use crate::store::{PassStore, RequestEdit};

#[derive(Default)]
struct Inner {
    students: HashMap<Uuid, StudentRow>,
    requests: HashMap<Uuid, RequestRow>,
    gate_logs: Vec<GateLogRow>,
    leaves: Vec<LeaveRecordRow>,
    delegations: Vec<DelegationRow>,
    policies: HashMap<(StudentCategory, PassCategory), PolicyRow>,
    calendar_exceptions: HashSet<NaiveDate>,
    adjustments: Vec<TrustAdjustmentRow>,
    restrictions: Vec<RestrictionRow>,
    department_heads: HashMap<Uuid, Uuid>,
    hostel_wardens: HashMap<Uuid, Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding (tests and local development) ──

    pub async fn put_student(&self, row: StudentRow) {
        self.inner.write().await.students.insert(row.student_id, row);
    }

    pub async fn put_policy(&self, row: PolicyRow) {
        self.inner
            .write()
            .await
            .policies
            .insert((row.student_category, row.pass_category), row);
    }

    pub async fn add_calendar_exception(&self, date: NaiveDate) {
        self.inner.write().await.calendar_exceptions.insert(date);
    }

    pub async fn add_leave(&self, row: LeaveRecordRow) {
        self.inner.write().await.leaves.push(row);
    }

    pub async fn add_restriction(&self, row: RestrictionRow) {
        self.inner.write().await.restrictions.push(row);
    }

    pub async fn put_department_head(&self, department_id: Uuid, head_id: Uuid) {
        self.inner
            .write()
            .await
            .department_heads
            .insert(department_id, head_id);
    }

    pub async fn put_hostel_warden(&self, hostel_id: Uuid, warden_id: Uuid) {
        self.inner
            .write()
            .await
            .hostel_wardens
            .insert(hostel_id, warden_id);
    }
}

#[async_trait]
impl PassStore for MemoryStore {
    async fn student(&self, id: Uuid) -> Result<Option<StudentRow>> {
        Ok(self.inner.read().await.students.get(&id).cloned())
    }

    async fn update_trust_score(&self, id: Uuid, score: i32) -> Result<()> {
        if let Some(s) = self.inner.write().await.students.get_mut(&id) {
            s.trust_score = score;
        }
        Ok(())
    }

    async fn set_pass_block(&self, id: Uuid, blocked: bool) -> Result<()> {
        if let Some(s) = self.inner.write().await.students.get_mut(&id) {
            s.pass_blocked = blocked;
        }
        Ok(())
    }

    async fn set_cooldown_override(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(s) = self.inner.write().await.students.get_mut(&id) {
            s.cooldown_override_at = Some(at);
        }
        Ok(())
    }

    async fn department_head(&self, department_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .inner
            .read()
            .await
            .department_heads
            .get(&department_id)
            .copied())
    }

    async fn hostel_warden(&self, hostel_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .inner
            .read()
            .await
            .hostel_wardens
            .get(&hostel_id)
            .copied())
    }

    async fn has_active_restriction(&self, student: &StudentRow, on: NaiveDate) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .restrictions
            .iter()
            .any(|r| r.applies_to(student, on)))
    }

    async fn insert_request(&self, row: &RequestRow) -> Result<()> {
        self.inner
            .write()
            .await
            .requests
            .insert(row.request_id, row.clone());
        Ok(())
    }

    async fn request(&self, id: Uuid) -> Result<Option<RequestRow>> {
        Ok(self.inner.read().await.requests.get(&id).cloned())
    }

    async fn request_by_token(&self, token: &str) -> Result<Option<RequestRow>> {
        Ok(self
            .inner
            .read()
            .await
            .requests
            .values()
            .find(|r| r.verify_token.as_deref() == Some(token))
            .cloned())
    }

    async fn open_request_for(&self, student_id: Uuid) -> Result<Option<RequestRow>> {
        Ok(self
            .inner
            .read()
            .await
            .requests
            .values()
            .find(|r| r.student_id == student_id && !r.status.is_terminal())
            .cloned())
    }

    async fn requests_in_status(&self, statuses: &[RequestStatus]) -> Result<Vec<RequestRow>> {
        let mut rows: Vec<RequestRow> = self
            .inner
            .read()
            .await
            .requests
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn transition_request(
        &self,
        id: Uuid,
        expected: RequestStatus,
        next: RequestStatus,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.requests.get_mut(&id) {
            Some(r) if r.status == expected => {
                r.status = next;
                if let Some(t) = token {
                    r.verify_token = Some(t.to_string());
                }
                r.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_request_fields(
        &self,
        id: Uuid,
        expected: RequestStatus,
        edit: &RequestEdit,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.requests.get_mut(&id) {
            Some(r) if r.status == expected => {
                r.category = edit.category;
                r.reason = edit.reason.clone();
                r.departure_at = edit.departure_at;
                r.return_at = edit.return_at;
                r.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_forwarded_to(&self, id: Uuid, forwarded_to: Option<Uuid>) -> Result<()> {
        if let Some(r) = self.inner.write().await.requests.get_mut(&id) {
            r.forwarded_to = forwarded_to;
        }
        Ok(())
    }

    async fn count_cancellations_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .requests
            .values()
            .filter(|r| {
                r.student_id == student_id
                    && r.status == RequestStatus::Cancelled
                    && r.updated_at >= since
            })
            .count() as i64)
    }

    async fn count_requests_between(
        &self,
        student_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .requests
            .values()
            .filter(|r| r.student_id == student_id && r.created_at >= from && r.created_at < to)
            .count() as i64)
    }

    async fn expire_past_return(&self, now: DateTime<Utc>) -> Result<Vec<RequestRow>> {
        let mut inner = self.inner.write().await;
        let mut swept = Vec::new();
        for r in inner.requests.values_mut() {
            if r.status.is_pre_exit() && r.return_at.map(|t| t < now).unwrap_or(false) {
                r.status = RequestStatus::Expired;
                r.updated_at = now;
                swept.push(r.clone());
            }
        }
        Ok(swept)
    }

    async fn expire_stale_ready(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestRow>> {
        let mut inner = self.inner.write().await;
        let exited: HashSet<Uuid> = inner
            .gate_logs
            .iter()
            .filter(|l| l.action == GateEvent::Exit)
            .map(|l| l.request_id)
            .collect();
        let mut swept = Vec::new();
        for r in inner.requests.values_mut() {
            if r.status == RequestStatus::Ready
                && r.departure_at < cutoff
                && !exited.contains(&r.request_id)
            {
                r.status = RequestStatus::Expired;
                r.updated_at = now;
                swept.push(r.clone());
            }
        }
        Ok(swept)
    }

    async fn latest_gate_log(&self, request_id: Uuid) -> Result<Option<GateLogRow>> {
        Ok(self
            .inner
            .read()
            .await
            .gate_logs
            .iter()
            .filter(|l| l.request_id == request_id)
            .max_by_key(|l| l.logged_at)
            .cloned())
    }

    async fn gate_logs(&self, request_id: Uuid) -> Result<Vec<GateLogRow>> {
        let mut logs: Vec<GateLogRow> = self
            .inner
            .read()
            .await
            .gate_logs
            .iter()
            .filter(|l| l.request_id == request_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.logged_at);
        Ok(logs)
    }

    async fn append_gate_log(&self, row: &GateLogRow) -> Result<()> {
        self.inner.write().await.gate_logs.push(row.clone());
        Ok(())
    }

    async fn policy(
        &self,
        student: StudentCategory,
        pass: PassCategory,
    ) -> Result<Option<PolicyRow>> {
        Ok(self
            .inner
            .read()
            .await
            .policies
            .get(&(student, pass))
            .cloned())
    }

    async fn is_calendar_exception(&self, date: NaiveDate) -> Result<bool> {
        Ok(self.inner.read().await.calendar_exceptions.contains(&date))
    }

    async fn on_approved_leave(&self, actor_id: Uuid, on: NaiveDate) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .leaves
            .iter()
            .any(|l| l.actor_id == actor_id && l.covers(on)))
    }

    async fn active_delegation_for(
        &self,
        authority_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegationRow>> {
        Ok(self
            .inner
            .read()
            .await
            .delegations
            .iter()
            .find(|d| d.authority_id == authority_id && d.in_force(at))
            .cloned())
    }

    async fn is_delegate_of(
        &self,
        actor_id: Uuid,
        authority_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .await
            .delegations
            .iter()
            .any(|d| d.authority_id == authority_id && d.delegate_id == actor_id && d.in_force(at)))
    }

    async fn activate_delegation(&self, row: &DelegationRow) -> Result<()> {
        let mut inner = self.inner.write().await;
        for d in inner.delegations.iter_mut() {
            if d.authority_id == row.authority_id {
                d.active = false;
            }
        }
        inner.delegations.push(row.clone());
        Ok(())
    }

    async fn append_trust_adjustment(&self, row: &TrustAdjustmentRow) -> Result<()> {
        self.inner.write().await.adjustments.push(row.clone());
        Ok(())
    }

    async fn trust_history(&self, student_id: Uuid) -> Result<Vec<TrustAdjustmentRow>> {
        let mut rows: Vec<TrustAdjustmentRow> = self
            .inner
            .read()
            .await
            .adjustments
            .iter()
            .filter(|a| a.student_id == student_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.created_at);
        Ok(rows)
    }
}
