//! Request Lifecycle
//!
//! Owns the pass request state machine: creation validation, the three
//! approval stages, cancellation and editing. Every mutation is a guarded
//! transition through the status table; a guarded update that affects zero
//! rows surfaces as a state conflict, never a false success.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GatepassConfig;
use crate::error::{PassError, Severity};
use crate::escalation::{ApprovalStage, EscalationResolver, ResolvedAuthority};
use crate::model::{RequestRow, StudentRow};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::policy::PolicyEngine;
use crate::status::{PassCategory, RequestStatus, StudentCategory};
use crate::store::{PassStore, RequestEdit};
use crate::trust::{TrustLedger, SYSTEM_ACTOR};

/// Payload for a new pass request.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRequest {
    pub student_id: Uuid,
    pub category: PassCategory,
    pub reason: String,
    pub departure_at: DateTime<Utc>,
    pub return_at: Option<DateTime<Utc>>,
}

/// An approver's verdict at any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl FromStr for Decision {
    type Err = crate::status::StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            _ => Err(crate::status::StatusParseError::Unknown(s.to_string())),
        }
    }
}

pub struct RequestLifecycle {
    store: Arc<dyn PassStore>,
    policy: PolicyEngine,
    resolver: EscalationResolver,
    trust: TrustLedger,
    notifier: Arc<dyn Notifier>,
    config: GatepassConfig,
}

impl RequestLifecycle {
    pub fn new(
        store: Arc<dyn PassStore>,
        notifier: Arc<dyn Notifier>,
        config: GatepassConfig,
    ) -> Self {
        Self {
            policy: PolicyEngine::new(store.clone(), config.clone()),
            resolver: EscalationResolver::new(store.clone()),
            trust: TrustLedger::new(store.clone(), notifier.clone(), config.clone()),
            store,
            notifier,
            config,
        }
    }

    pub fn trust_ledger(&self) -> &TrustLedger {
        &self.trust
    }

    pub fn resolver(&self) -> &EscalationResolver {
        &self.resolver
    }

    pub async fn get(&self, request_id: Uuid) -> Result<RequestRow, PassError> {
        self.store
            .request(request_id)
            .await?
            .ok_or(PassError::NotFound("request", request_id))
    }

    // ── Create ──

    pub async fn create(&self, new: NewRequest) -> Result<RequestRow, PassError> {
        let now = Utc::now();
        let student = self
            .store
            .student(new.student_id)
            .await?
            .ok_or(PassError::NotFound("student", new.student_id))?;

        if !student.active {
            return Err(PassError::eligibility(
                Severity::Critical,
                "account is suspended or inactive",
            ));
        }
        if let Some(open) = self.store.open_request_for(student.student_id).await? {
            return Err(PassError::validation(format!(
                "an outstanding request already exists ({})",
                open.status
            )));
        }

        if new.departure_at > now + Duration::days(self.config.max_advance_days) {
            return Err(PassError::validation(format!(
                "departure may be at most {} days ahead",
                self.config.max_advance_days
            )));
        }
        if new.departure_at < now - Duration::minutes(self.config.creation_grace_minutes) {
            return Err(PassError::validation("departure time is already in the past"));
        }

        let return_at = match new.return_at {
            Some(r) if r <= new.departure_at => {
                return Err(PassError::validation("return time must be after departure"));
            }
            Some(r) => r,
            // Open-ended passes run to the end of the departure day.
            None => end_of_day(new.departure_at),
        };

        let verdict = self
            .policy
            .evaluate(
                student.category,
                new.category,
                new.departure_at,
                return_at - new.departure_at,
            )
            .await?;
        if !verdict.allowed {
            return Err(PassError::Validation(
                verdict.reason.unwrap_or_else(|| "pass not permitted by policy".to_string()),
            ));
        }

        self.check_eligibility(&student, now).await?;

        let stage1 = self
            .resolver
            .resolve(ApprovalStage::Mentor, &student, now.date_naive())
            .await?;

        let row = RequestRow {
            request_id: Uuid::new_v4(),
            student_id: student.student_id,
            category: new.category,
            reason: new.reason,
            departure_at: new.departure_at,
            return_at: Some(return_at),
            status: RequestStatus::Pending,
            forwarded_to: forwarded(&stage1, student.mentor_id),
            verify_token: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_request(&row).await?;

        info!(
            request_id = %row.request_id,
            student_id = %student.student_id,
            category = %row.category,
            "request created"
        );

        self.apply_monthly_volume_penalty(&student, now).await;

        self.send(Notification::new(
            stage1.actor_id,
            NotificationKind::ApprovalPending,
            Some(row.request_id),
            format!("{} requests a {} pass", student.name, row.category),
        ))
        .await;

        Ok(row)
    }

    async fn check_eligibility(
        &self,
        student: &StudentRow,
        now: DateTime<Utc>,
    ) -> Result<(), PassError> {
        if student.trust_score < self.config.min_trust_to_create {
            return Err(PassError::eligibility(
                Severity::Critical,
                format!(
                    "trust score {} is below the minimum of {}",
                    student.trust_score, self.config.min_trust_to_create
                ),
            ));
        }
        if student.pass_blocked {
            return Err(PassError::eligibility(
                Severity::Critical,
                "pass privileges are blocked by an authority",
            ));
        }
        if self
            .store
            .has_active_restriction(student, now.date_naive())
            .await?
        {
            return Err(PassError::eligibility(
                Severity::Warning,
                "a department or year-wide restriction is in force",
            ));
        }
        if self.trust.cooldown_tripped(student, now).await? {
            return Err(PassError::eligibility(
                Severity::Warning,
                format!(
                    "too many recent cancellations; wait up to {}h or ask an authority to reset",
                    self.config.cooldown_window_hours
                ),
            ));
        }
        Ok(())
    }

    /// The 5th-or-later request inside a calendar month costs a small
    /// trust penalty. Runs after insert; failure never unwinds the create.
    async fn apply_monthly_volume_penalty(&self, student: &StudentRow, now: DateTime<Utc>) {
        let (from, to) = month_bounds(now);
        let submitted = match self
            .store
            .count_requests_between(student.student_id, from, to)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(student_id = %student.student_id, error = %e, "volume count failed");
                return;
            }
        };
        if submitted >= self.config.monthly_request_threshold {
            if let Err(e) = self
                .trust
                .adjust(
                    student.student_id,
                    -self.config.monthly_excess_penalty,
                    "request volume above the monthly threshold",
                    SYSTEM_ACTOR,
                )
                .await
            {
                warn!(student_id = %student.student_id, error = %e, "volume penalty failed");
            }
        }
    }

    // ── Approval stages ──

    /// Stage 1 ("recommend"): the resolved mentor-level authority moves
    /// `pending` forward or rejects.
    pub async fn decide_stage1(
        &self,
        request_id: Uuid,
        actor_id: Uuid,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<RequestRow, PassError> {
        let request = self.expect_status(request_id, RequestStatus::Pending).await?;
        let student = self.student_of(&request).await?;

        let resolved = self
            .resolver
            .resolve(ApprovalStage::Mentor, &student, Utc::now().date_naive())
            .await?;
        if actor_id != resolved.actor_id {
            return Err(PassError::Authorization(
                "actor does not hold stage-1 authority for this request".to_string(),
            ));
        }

        let next = match decision {
            Decision::Approve => RequestStatus::Recommended,
            Decision::Reject => RequestStatus::Rejected,
        };
        let updated = self.guarded_transition(&request, next, None).await?;

        self.notify_student(&student, &updated, reason.as_deref()).await;
        if decision == Decision::Approve {
            let stage2 = self
                .resolver
                .resolve(ApprovalStage::DepartmentHead, &student, Utc::now().date_naive())
                .await?;
            self.store
                .set_forwarded_to(request_id, forwarded(&stage2, stage2.actor_id))
                .await?;
            self.send(Notification::new(
                stage2.actor_id,
                NotificationKind::ApprovalPending,
                Some(request_id),
                format!("{} pass for {} awaits approval", updated.category, student.name),
            ))
            .await;
        }
        Ok(updated)
    }

    /// Stage 2 ("approve"): the department head or the holder of their
    /// active grant. Day-scholars become gate-ready here; residents route
    /// on to the warden.
    pub async fn decide_stage2(
        &self,
        request_id: Uuid,
        actor_id: Uuid,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<RequestRow, PassError> {
        let now = Utc::now();
        let request = self.expect_status(request_id, RequestStatus::Recommended).await?;
        let student = self.student_of(&request).await?;

        if !self
            .resolver
            .holds_stage2_authority(actor_id, student.department_id, now)
            .await?
        {
            return Err(PassError::Authorization(
                "actor does not hold stage-2 authority for this department".to_string(),
            ));
        }

        let (next, token) = match (decision, student.category) {
            (Decision::Reject, _) => (RequestStatus::Rejected, None),
            (Decision::Approve, StudentCategory::DayScholar) => {
                (RequestStatus::Ready, Some(new_verify_token()))
            }
            (Decision::Approve, StudentCategory::Resident) => (RequestStatus::Approved, None),
        };
        let updated = self
            .guarded_transition(&request, next, token.as_deref())
            .await?;

        self.notify_student(&student, &updated, reason.as_deref()).await;
        if updated.status == RequestStatus::Approved {
            let warden = self
                .resolver
                .resolve(ApprovalStage::Warden, &student, now.date_naive())
                .await?;
            self.send(Notification::new(
                warden.actor_id,
                NotificationKind::ApprovalPending,
                Some(request_id),
                format!("{} pass for {} awaits verification", updated.category, student.name),
            ))
            .await;
        }
        Ok(updated)
    }

    /// Stage 3 ("verify"): only the warden of the requester's hostel.
    /// Residents below the trust threshold are refused unless overridden.
    pub async fn decide_stage3(
        &self,
        request_id: Uuid,
        actor_id: Uuid,
        decision: Decision,
        reason: Option<String>,
        trust_override: bool,
    ) -> Result<RequestRow, PassError> {
        let request = self.expect_status(request_id, RequestStatus::Approved).await?;
        let student = self.student_of(&request).await?;

        let warden = self
            .resolver
            .resolve(ApprovalStage::Warden, &student, Utc::now().date_naive())
            .await?;
        if actor_id != warden.actor_id {
            return Err(PassError::Authorization(
                "actor is not the warden for this student's hostel".to_string(),
            ));
        }

        if decision == Decision::Approve
            && student.trust_score < self.config.min_trust_to_verify
            && !trust_override
        {
            return Err(PassError::eligibility(
                Severity::Warning,
                format!(
                    "trust score {} is below the verification minimum of {}; override required",
                    student.trust_score, self.config.min_trust_to_verify
                ),
            ));
        }

        let (next, token) = match decision {
            Decision::Approve => (RequestStatus::Ready, Some(new_verify_token())),
            Decision::Reject => (RequestStatus::Rejected, None),
        };
        let updated = self
            .guarded_transition(&request, next, token.as_deref())
            .await?;
        self.notify_student(&student, &updated, reason.as_deref()).await;
        Ok(updated)
    }

    // ── Cancellation & edit ──

    /// Requester-initiated cancellation. Refused outright while the student
    /// is physically out; late cancellations (after stage-2/3 approval)
    /// cost the trust penalty.
    pub async fn cancel(&self, request_id: Uuid, caller: Uuid) -> Result<RequestRow, PassError> {
        let request = self.get(request_id).await?;
        if request.student_id != caller {
            return Err(PassError::Authorization(
                "only the requester may cancel a pass".to_string(),
            ));
        }
        if request.status.is_terminal() {
            return Err(PassError::StateConflict {
                expected: "an open request",
                actual: request.status.to_string(),
            });
        }
        if request.status == RequestStatus::Active {
            return Err(PassError::validation(
                "pass is active and the student is outside campus; record gate entry first",
            ));
        }

        let late = matches!(
            request.status,
            RequestStatus::Approved | RequestStatus::Ready
        );
        let updated = self
            .guarded_transition(&request, RequestStatus::Cancelled, None)
            .await?;

        if late {
            if let Err(e) = self
                .trust
                .adjust(
                    request.student_id,
                    -self.config.late_cancel_penalty,
                    "cancelled after approval",
                    SYSTEM_ACTOR,
                )
                .await
            {
                warn!(request_id = %request_id, error = %e, "late-cancel penalty failed");
            }
        }

        info!(request_id = %request_id, late, "request cancelled");
        let student = self.student_of(&updated).await?;
        self.notify_student(&student, &updated, None).await;
        Ok(updated)
    }

    /// In-place edit, only while `pending` and only when the currently
    /// scheduled departure is still outside the lock window.
    pub async fn edit(
        &self,
        request_id: Uuid,
        caller: Uuid,
        edit: NewRequest,
    ) -> Result<RequestRow, PassError> {
        let now = Utc::now();
        let request = self.expect_status(request_id, RequestStatus::Pending).await?;
        if request.student_id != caller {
            return Err(PassError::Authorization(
                "only the requester may edit a pass".to_string(),
            ));
        }
        if request.departure_at <= now + Duration::hours(self.config.edit_lock_hours) {
            return Err(PassError::validation(format!(
                "requests lock {}h before departure",
                self.config.edit_lock_hours
            )));
        }

        if edit.departure_at > now + Duration::days(self.config.max_advance_days) {
            return Err(PassError::validation(format!(
                "departure may be at most {} days ahead",
                self.config.max_advance_days
            )));
        }
        if edit.departure_at < now - Duration::minutes(self.config.creation_grace_minutes) {
            return Err(PassError::validation("departure time is already in the past"));
        }
        let return_at = match edit.return_at {
            Some(r) if r <= edit.departure_at => {
                return Err(PassError::validation("return time must be after departure"));
            }
            Some(r) => r,
            None => end_of_day(edit.departure_at),
        };

        let student = self.student_of(&request).await?;
        let verdict = self
            .policy
            .evaluate(
                student.category,
                edit.category,
                edit.departure_at,
                return_at - edit.departure_at,
            )
            .await?;
        if !verdict.allowed {
            return Err(PassError::Validation(
                verdict.reason.unwrap_or_else(|| "pass not permitted by policy".to_string()),
            ));
        }

        let fields = RequestEdit {
            category: edit.category,
            reason: edit.reason,
            departure_at: edit.departure_at,
            return_at: Some(return_at),
        };
        let applied = self
            .store
            .update_request_fields(request_id, RequestStatus::Pending, &fields, now)
            .await?;
        if !applied {
            return Err(self.conflict_for(request_id, RequestStatus::Pending).await);
        }
        self.get(request_id).await
    }

    // ── Approval queue ──

    /// Requests the actor currently holds authority to decide, across all
    /// three stages.
    pub async fn queue_for(&self, actor_id: Uuid) -> Result<Vec<RequestRow>, PassError> {
        let now = Utc::now();
        let today = now.date_naive();
        let open = self
            .store
            .requests_in_status(&[
                RequestStatus::Pending,
                RequestStatus::Recommended,
                RequestStatus::Approved,
            ])
            .await?;

        let mut mine = Vec::new();
        for request in open {
            let student = match self.store.student(request.student_id).await? {
                Some(s) => s,
                None => continue,
            };
            let holds = match request.status {
                RequestStatus::Pending => {
                    self.resolver
                        .resolve(ApprovalStage::Mentor, &student, today)
                        .await?
                        .actor_id
                        == actor_id
                }
                RequestStatus::Recommended => {
                    self.resolver
                        .holds_stage2_authority(actor_id, student.department_id, now)
                        .await?
                }
                RequestStatus::Approved => {
                    self.resolver
                        .resolve(ApprovalStage::Warden, &student, today)
                        .await?
                        .actor_id
                        == actor_id
                }
                _ => false,
            };
            if holds {
                mine.push(request);
            }
        }
        Ok(mine)
    }

    /// Authority lockout independent of the trust score.
    pub async fn set_pass_block(
        &self,
        student_id: Uuid,
        blocked: bool,
    ) -> Result<(), PassError> {
        if self.store.student(student_id).await?.is_none() {
            return Err(PassError::NotFound("student", student_id));
        }
        self.store.set_pass_block(student_id, blocked).await?;
        info!(student_id = %student_id, blocked, "pass block updated");
        Ok(())
    }

    // ── Internals ──

    async fn expect_status(
        &self,
        request_id: Uuid,
        expected: RequestStatus,
    ) -> Result<RequestRow, PassError> {
        let request = self.get(request_id).await?;
        if request.status != expected {
            return Err(PassError::StateConflict {
                expected: expected.as_str(),
                actual: request.status.to_string(),
            });
        }
        Ok(request)
    }

    /// One conditional update through the transition table. Zero affected
    /// rows means another actor moved the request first.
    async fn guarded_transition(
        &self,
        request: &RequestRow,
        next: RequestStatus,
        token: Option<&str>,
    ) -> Result<RequestRow, PassError> {
        if !request.status.can_transition_to(next) {
            return Err(PassError::validation(format!(
                "transition {} -> {next} is not defined",
                request.status
            )));
        }
        let applied = self
            .store
            .transition_request(request.request_id, request.status, next, token, Utc::now())
            .await?;
        if !applied {
            return Err(self.conflict_for(request.request_id, request.status).await);
        }
        info!(
            request_id = %request.request_id,
            from = %request.status,
            to = %next,
            "request transitioned"
        );
        self.get(request.request_id).await
    }

    async fn conflict_for(&self, request_id: Uuid, expected: RequestStatus) -> PassError {
        let actual = match self.store.request(request_id).await {
            Ok(Some(r)) => r.status.to_string(),
            _ => "unknown".to_string(),
        };
        PassError::StateConflict {
            expected: expected.as_str(),
            actual,
        }
    }

    async fn student_of(&self, request: &RequestRow) -> Result<StudentRow, PassError> {
        self.store
            .student(request.student_id)
            .await?
            .ok_or(PassError::NotFound("student", request.student_id))
    }

    async fn notify_student(
        &self,
        student: &StudentRow,
        request: &RequestRow,
        reason: Option<&str>,
    ) {
        let body = match reason {
            Some(r) => format!("{} pass is now {}: {}", request.category, request.status, r),
            None => format!("{} pass is now {}", request.category, request.status),
        };
        self.send(Notification::new(
            student.student_id,
            NotificationKind::StatusChanged,
            Some(request.request_id),
            body,
        ))
        .await;
    }

    async fn send(&self, n: Notification) {
        if let Err(e) = self.notifier.publish(n).await {
            warn!(error = %e, "notification publish failed");
        }
    }
}

fn forwarded(resolved: &ResolvedAuthority, assigned: Uuid) -> Option<Uuid> {
    if resolved.is_delegate || resolved.actor_id != assigned {
        Some(resolved.actor_id)
    } else {
        None
    }
}

fn new_verify_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn end_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(23, 59, 59)
        .expect("valid end-of-day time")
        .and_utc()
}

fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let first = now
        .date_naive()
        .with_day(1)
        .expect("first of month is valid")
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid")
        .and_utc();
    let next = if now.month() == 12 {
        first
            .date_naive()
            .with_year(now.year() + 1)
            .and_then(|d| d.with_month(1))
    } else {
        first.date_naive().with_month(now.month() + 1)
    }
    .expect("next month is valid")
    .and_hms_opt(0, 0, 0)
    .expect("midnight is valid")
    .and_utc();
    (first, next)
}
