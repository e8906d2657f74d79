//! Escalation & Delegation Resolver
//!
//! Decides who currently holds approval authority at each stage. Staff
//! leave escalates stage-1 items to the department head; a head on leave
//! hands stage-2 authority to the active delegate. An active delegation
//! grant confers authority over any stage-2 item in the department, not
//! only escalated ones.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PassError;
use crate::model::{DelegationRow, StudentRow};
use crate::store::PassStore;

/// The three sequential approval stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStage {
    Mentor,
    DepartmentHead,
    Warden,
}

/// Who holds authority for a stage right now.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAuthority {
    pub actor_id: Uuid,
    /// Authority held through a delegation grant rather than assignment.
    pub is_delegate: bool,
    /// The resolved actor is on leave with nobody to hand over to; the
    /// item stays queued with them pending manual routing.
    pub on_leave: bool,
}

impl ResolvedAuthority {
    fn assigned(actor_id: Uuid) -> Self {
        Self {
            actor_id,
            is_delegate: false,
            on_leave: false,
        }
    }
}

pub struct EscalationResolver {
    store: Arc<dyn PassStore>,
}

impl EscalationResolver {
    pub fn new(store: Arc<dyn PassStore>) -> Self {
        Self { store }
    }

    /// Resolve the actor holding authority for `stage` over this student's
    /// requests today.
    pub async fn resolve(
        &self,
        stage: ApprovalStage,
        student: &StudentRow,
        today: NaiveDate,
    ) -> Result<ResolvedAuthority, PassError> {
        match stage {
            ApprovalStage::Mentor => self.resolve_stage1(student, today).await,
            ApprovalStage::DepartmentHead => self.resolve_stage2(student.department_id, today).await,
            ApprovalStage::Warden => self.resolve_stage3(student).await,
        }
    }

    async fn resolve_stage1(
        &self,
        student: &StudentRow,
        today: NaiveDate,
    ) -> Result<ResolvedAuthority, PassError> {
        if !self.store.on_approved_leave(student.mentor_id, today).await? {
            return Ok(ResolvedAuthority::assigned(student.mentor_id));
        }
        // Mentor unavailable: the item escalates to stage-2 authority.
        self.resolve_stage2(student.department_id, today).await
    }

    async fn resolve_stage2(
        &self,
        department_id: Uuid,
        today: NaiveDate,
    ) -> Result<ResolvedAuthority, PassError> {
        let head = self
            .store
            .department_head(department_id)
            .await?
            .ok_or(PassError::NotFound("department head", department_id))?;

        if !self.store.on_approved_leave(head, today).await? {
            return Ok(ResolvedAuthority::assigned(head));
        }

        let now = Utc::now();
        match self.store.active_delegation_for(head, now).await? {
            Some(grant) => Ok(ResolvedAuthority {
                actor_id: grant.delegate_id,
                is_delegate: true,
                on_leave: false,
            }),
            // No delegate: queued with the head, pending manual routing.
            None => Ok(ResolvedAuthority {
                actor_id: head,
                is_delegate: false,
                on_leave: true,
            }),
        }
    }

    async fn resolve_stage3(&self, student: &StudentRow) -> Result<ResolvedAuthority, PassError> {
        let hostel_id = student.hostel_id.ok_or_else(|| {
            PassError::validation("student has no hostel assignment for warden verification")
        })?;
        let warden = self
            .store
            .hostel_warden(hostel_id)
            .await?
            .ok_or(PassError::NotFound("hostel warden", hostel_id))?;
        Ok(ResolvedAuthority::assigned(warden))
    }

    /// Whether `actor` may act on stage-2 items of this department: the
    /// head, or the holder of the head's active grant (department-wide,
    /// not per-request).
    pub async fn holds_stage2_authority(
        &self,
        actor_id: Uuid,
        department_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, PassError> {
        let head = self
            .store
            .department_head(department_id)
            .await?
            .ok_or(PassError::NotFound("department head", department_id))?;
        if actor_id == head {
            return Ok(true);
        }
        Ok(self.store.is_delegate_of(actor_id, head, at).await?)
    }

    /// Activate a new grant. Any prior active grant for the same authority
    /// is deactivated in the same step, preserving the one-active-grant
    /// invariant.
    pub async fn grant_delegation(
        &self,
        authority_id: Uuid,
        delegate_id: Uuid,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Result<DelegationRow, PassError> {
        if ends_at <= starts_at {
            return Err(PassError::validation("delegation window must end after it starts"));
        }
        let row = DelegationRow {
            delegation_id: Uuid::new_v4(),
            authority_id,
            delegate_id,
            starts_at,
            ends_at,
            active: true,
        };
        self.store.activate_delegation(&row).await?;
        tracing::info!(
            authority = %authority_id,
            delegate = %delegate_id,
            until = %ends_at,
            "delegation activated"
        );
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LeaveRecordRow;
    use crate::status::StudentCategory;
    use crate::store_memory::MemoryStore;
    use chrono::Duration;

    struct Campus {
        store: Arc<MemoryStore>,
        resolver: EscalationResolver,
        student: StudentRow,
        mentor: Uuid,
        head: Uuid,
        warden: Uuid,
    }

    async fn campus() -> Campus {
        let store = Arc::new(MemoryStore::new());
        let mentor = Uuid::new_v4();
        let head = Uuid::new_v4();
        let warden = Uuid::new_v4();
        let department_id = Uuid::new_v4();
        let hostel_id = Uuid::new_v4();

        let student = StudentRow {
            student_id: Uuid::new_v4(),
            name: "Ravi Kumar".to_string(),
            category: StudentCategory::Resident,
            active: true,
            trust_score: 80,
            pass_blocked: false,
            cooldown_override_at: None,
            year_of_study: 3,
            mentor_id: mentor,
            department_id,
            hostel_id: Some(hostel_id),
        };
        store.put_student(student.clone()).await;
        store.put_department_head(department_id, head).await;
        store.put_hostel_warden(hostel_id, warden).await;

        Campus {
            resolver: EscalationResolver::new(store.clone()),
            store,
            student,
            mentor,
            head,
            warden,
        }
    }

    fn leave_today(actor_id: Uuid, today: NaiveDate) -> LeaveRecordRow {
        LeaveRecordRow {
            leave_id: Uuid::new_v4(),
            actor_id,
            starts_on: today,
            ends_on: today,
            approved: true,
        }
    }

    #[tokio::test]
    async fn stage1_goes_to_assigned_mentor() {
        let c = campus().await;
        let today = Utc::now().date_naive();
        let r = c
            .resolver
            .resolve(ApprovalStage::Mentor, &c.student, today)
            .await
            .unwrap();
        assert_eq!(r.actor_id, c.mentor);
        assert!(!r.is_delegate);
        assert!(!r.on_leave);
    }

    #[tokio::test]
    async fn mentor_on_leave_escalates_to_head() {
        let c = campus().await;
        let today = Utc::now().date_naive();
        c.store.add_leave(leave_today(c.mentor, today)).await;

        let r = c
            .resolver
            .resolve(ApprovalStage::Mentor, &c.student, today)
            .await
            .unwrap();
        assert_eq!(r.actor_id, c.head);
    }

    #[tokio::test]
    async fn head_on_leave_routes_to_active_delegate() {
        let c = campus().await;
        let today = Utc::now().date_naive();
        c.store.add_leave(leave_today(c.mentor, today)).await;
        c.store.add_leave(leave_today(c.head, today)).await;

        let delegate = Uuid::new_v4();
        let now = Utc::now();
        c.resolver
            .grant_delegation(c.head, delegate, now - Duration::hours(1), now + Duration::days(3))
            .await
            .unwrap();

        let r = c
            .resolver
            .resolve(ApprovalStage::Mentor, &c.student, today)
            .await
            .unwrap();
        assert_eq!(r.actor_id, delegate);
        assert!(r.is_delegate);
    }

    #[tokio::test]
    async fn head_on_leave_without_delegate_stays_queued() {
        let c = campus().await;
        let today = Utc::now().date_naive();
        c.store.add_leave(leave_today(c.head, today)).await;

        let r = c
            .resolver
            .resolve(ApprovalStage::DepartmentHead, &c.student, today)
            .await
            .unwrap();
        assert_eq!(r.actor_id, c.head);
        assert!(r.on_leave, "no silent drop: queued with the head");
    }

    #[tokio::test]
    async fn delegate_holds_department_wide_stage2_authority() {
        let c = campus().await;
        let delegate = Uuid::new_v4();
        let now = Utc::now();
        c.resolver
            .grant_delegation(c.head, delegate, now - Duration::hours(1), now + Duration::days(3))
            .await
            .unwrap();

        // Head is NOT on leave, yet the delegate still holds authority.
        assert!(c
            .resolver
            .holds_stage2_authority(delegate, c.student.department_id, now)
            .await
            .unwrap());
        assert!(c
            .resolver
            .holds_stage2_authority(c.head, c.student.department_id, now)
            .await
            .unwrap());
        assert!(!c
            .resolver
            .holds_stage2_authority(Uuid::new_v4(), c.student.department_id, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn new_grant_deactivates_the_previous_one() {
        let c = campus().await;
        let now = Utc::now();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        c.resolver
            .grant_delegation(c.head, first, now - Duration::hours(2), now + Duration::days(3))
            .await
            .unwrap();
        c.resolver
            .grant_delegation(c.head, second, now - Duration::hours(1), now + Duration::days(3))
            .await
            .unwrap();

        assert!(!c.resolver.holds_stage2_authority(first, c.student.department_id, now).await.unwrap());
        assert!(c.resolver.holds_stage2_authority(second, c.student.department_id, now).await.unwrap());
        let active = c.store.active_delegation_for(c.head, now).await.unwrap().unwrap();
        assert_eq!(active.delegate_id, second);
    }

    #[tokio::test]
    async fn stage3_is_the_hostel_warden() {
        let c = campus().await;
        let today = Utc::now().date_naive();
        let r = c
            .resolver
            .resolve(ApprovalStage::Warden, &c.student, today)
            .await
            .unwrap();
        assert_eq!(r.actor_id, c.warden);
    }
}
