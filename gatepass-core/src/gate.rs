//! Gate Verifier
//!
//! Derives the live, momentary status of a pass at the checkpoint. Status
//! is never stored: it is computed each time from the request's approval
//! state plus the most recent gate log entry. Recording an action is the
//! only mutation here, and it is guarded by the same conditional update
//! discipline as the approval stages, so a double-exit or double-entry
//! race cannot produce two rows.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GatepassConfig;
use crate::error::PassError;
use crate::model::{GateLogRow, RequestRow, StudentRow};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::policy::PolicyEngine;
use crate::status::{GateActionKind, GateEvent, PassCategory, RequestStatus, StudentCategory};
use crate::store::PassStore;

/// Momentary, derived state of a pass at the gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GateStatus {
    /// Policy requires no physical scan for this pass.
    GateNotRequired,
    /// Resident internal movement, not a campus exit.
    InternalOnly,
    /// Approval chain not finished; nothing for the gate yet.
    NotReady,
    /// Cleared and inside the departure window.
    Ready,
    /// Cleared but ahead of the early-departure buffer.
    TooEarly,
    /// Exit recorded, return time not yet passed.
    Out,
    /// Exit recorded and the scheduled return has elapsed.
    Overdue { minutes: i64 },
    /// Pass already consumed (entry recorded or completed).
    Used,
    /// No longer usable (expired, cancelled, rejected, or past the hard
    /// departure cutoff).
    Expired,
}

/// What the verifier tells the gatekeeper.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub status: GateStatus,
    pub allowed_actions: Vec<GateEvent>,
    pub warning: Option<String>,
}

impl GateDecision {
    fn closed(status: GateStatus) -> Self {
        Self {
            status,
            allowed_actions: Vec::new(),
            warning: None,
        }
    }

    fn open(status: GateStatus, action: GateEvent, warning: Option<String>) -> Self {
        Self {
            status,
            allowed_actions: vec![action],
            warning,
        }
    }
}

/// Decision plus context for the gatekeeper's screen.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub request: RequestRow,
    pub student_name: String,
    pub decision: GateDecision,
}

pub struct GateVerifier {
    store: Arc<dyn PassStore>,
    policy: PolicyEngine,
    notifier: Arc<dyn Notifier>,
    config: GatepassConfig,
}

impl GateVerifier {
    pub fn new(
        store: Arc<dyn PassStore>,
        notifier: Arc<dyn Notifier>,
        config: GatepassConfig,
    ) -> Self {
        Self {
            policy: PolicyEngine::new(store.clone(), config.clone()),
            store,
            notifier,
            config,
        }
    }

    /// Look a pass up by verification token (or request id as a fallback)
    /// and derive its current gate decision.
    pub async fn verify(&self, identifier: &str, now: DateTime<Utc>) -> Result<GateReport, PassError> {
        let request = match self.store.request_by_token(identifier).await? {
            Some(r) => r,
            None => {
                let id = Uuid::parse_str(identifier).map_err(|_| {
                    PassError::validation("identifier is neither a known token nor a request id")
                })?;
                self.store
                    .request(id)
                    .await?
                    .ok_or(PassError::NotFound("request", id))?
            }
        };
        let student = self
            .store
            .student(request.student_id)
            .await?
            .ok_or(PassError::NotFound("student", request.student_id))?;
        let decision = self.evaluate(&request, &student, now).await?;
        Ok(GateReport {
            student_name: student.name,
            request,
            decision,
        })
    }

    /// Derive the momentary decision for a request.
    pub async fn evaluate(
        &self,
        request: &RequestRow,
        student: &StudentRow,
        now: DateTime<Utc>,
    ) -> Result<GateDecision, PassError> {
        let gate_action = self
            .policy
            .required_gate_action(student.category, request.category)
            .await?;
        let latest = self.store.latest_gate_log(request.request_id).await?;
        Ok(derive(request, student.category, gate_action, latest.as_ref(), now, &self.config))
    }

    /// Record a physical exit or entry. The request transition commits
    /// under a status guard before the log row is appended; a repeat of
    /// the same action is rejected as a duplicate, never absorbed.
    pub async fn log_action(
        &self,
        request_id: Uuid,
        action: GateEvent,
        gatekeeper_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<GateReport, PassError> {
        let request = self
            .store
            .request(request_id)
            .await?
            .ok_or(PassError::NotFound("request", request_id))?;
        let student = self
            .store
            .student(request.student_id)
            .await?
            .ok_or(PassError::NotFound("student", request.student_id))?;

        let decision = self.evaluate(&request, &student, now).await?;
        if !decision.allowed_actions.contains(&action) {
            let latest = self.store.latest_gate_log(request_id).await?;
            if latest.map(|l| l.action) == Some(action) {
                return Err(PassError::validation(format!(
                    "duplicate {action} scan for this pass"
                )));
            }
            return Err(PassError::StateConflict {
                expected: action.as_str(),
                actual: format!("gate reports {:?}", decision.status),
            });
        }

        let (expected, next) = match action {
            GateEvent::Exit => {
                let gate_action = self
                    .policy
                    .required_gate_action(student.category, request.category)
                    .await?;
                // A single-scan pass completes on the exit itself.
                if gate_action == GateActionKind::ExitOnly {
                    (RequestStatus::Ready, RequestStatus::Completed)
                } else {
                    (RequestStatus::Ready, RequestStatus::Active)
                }
            }
            GateEvent::Entry => (RequestStatus::Active, RequestStatus::Completed),
        };

        let applied = self
            .store
            .transition_request(request_id, expected, next, None, now)
            .await?;
        if !applied {
            // Another gatekeeper moved the pass between our read and write.
            let actual = self
                .store
                .request(request_id)
                .await?
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(PassError::StateConflict {
                expected: expected.as_str(),
                actual,
            });
        }

        self.store
            .append_gate_log(&GateLogRow {
                log_id: Uuid::new_v4(),
                request_id,
                action,
                gatekeeper_id,
                logged_at: now,
            })
            .await?;

        info!(
            request_id = %request_id,
            action = %action,
            gatekeeper = %gatekeeper_id,
            "gate action recorded"
        );

        let note = Notification::new(
            request.student_id,
            NotificationKind::GateEvent,
            Some(request_id),
            format!("Gate {action} recorded for your {} pass", request.category),
        );
        if let Err(e) = self.notifier.publish(note).await {
            warn!(request_id = %request_id, error = %e, "gate notification failed");
        }

        let request = self
            .store
            .request(request_id)
            .await?
            .ok_or(PassError::NotFound("request", request_id))?;
        let decision = self.evaluate(&request, &student, now).await?;
        Ok(GateReport {
            student_name: student.name.clone(),
            request,
            decision,
        })
    }
}

/// The pure derivation, in the decision order of the verification
/// procedure: policy class first, then log pairing, then time buffers.
pub fn derive(
    request: &RequestRow,
    student_category: StudentCategory,
    gate_action: GateActionKind,
    latest: Option<&GateLogRow>,
    now: DateTime<Utc>,
    config: &GatepassConfig,
) -> GateDecision {
    // 1. Passes the gate never sees.
    match gate_action {
        GateActionKind::NoScan => return GateDecision::closed(GateStatus::GateNotRequired),
        GateActionKind::InternalOnly => return GateDecision::closed(GateStatus::InternalOnly),
        _ => {}
    }

    // Terminal or not-yet-cleared approval states short-circuit the rest.
    match request.status {
        RequestStatus::Completed => return GateDecision::closed(GateStatus::Used),
        RequestStatus::Rejected | RequestStatus::Cancelled | RequestStatus::Expired => {
            return GateDecision::closed(GateStatus::Expired)
        }
        RequestStatus::Pending | RequestStatus::Recommended | RequestStatus::Approved => {
            return GateDecision::closed(GateStatus::NotReady)
        }
        RequestStatus::Ready | RequestStatus::Active => {}
    }

    match latest.map(|l| l.action) {
        // 4. Out: waiting on the entry scan.
        Some(GateEvent::Exit) => {
            if gate_action == GateActionKind::ExitOnly {
                return GateDecision::closed(GateStatus::Used);
            }
            match request.return_at {
                Some(return_at) if now > return_at => {
                    let minutes = (now - return_at).num_minutes();
                    GateDecision::open(
                        GateStatus::Overdue { minutes },
                        GateEvent::Entry,
                        Some(format!("student is {minutes} minutes overdue")),
                    )
                }
                _ => GateDecision::open(GateStatus::Out, GateEvent::Entry, None),
            }
        }
        // 5. Entry already recorded: the pass is spent.
        Some(GateEvent::Entry) => GateDecision::closed(GateStatus::Used),
        // 2 & 3. No log yet: the exit scan, subject to the time buffers.
        None => {
            let grace = if request.category == PassCategory::Emergency {
                Duration::hours(config.emergency_grace_hours)
            } else {
                Duration::minutes(config.departure_grace_minutes)
            };
            if now > request.departure_at + grace {
                // Day-scholar permission passes expire hard; everything
                // else exits with a late flag for gatekeeper discretion.
                if student_category == StudentCategory::DayScholar
                    && request.category == PassCategory::Permission
                {
                    return GateDecision::closed(GateStatus::Expired);
                }
                return GateDecision::open(
                    GateStatus::Ready,
                    GateEvent::Exit,
                    Some("departure window passed; verify before allowing exit".to_string()),
                );
            }
            let early_limit = request.departure_at - Duration::hours(config.early_departure_hours);
            if now < early_limit {
                return GateDecision::open(
                    GateStatus::TooEarly,
                    GateEvent::Exit,
                    Some("ahead of scheduled departure; exit at gatekeeper discretion".to_string()),
                );
            }
            GateDecision::open(GateStatus::Ready, GateEvent::Exit, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{Decision, NewRequest};
    use crate::model::PolicyRow;
    use crate::status::HolidayBehavior;
    use crate::testutil::{soon, Campus};

    fn request_in(status: RequestStatus, departure: DateTime<Utc>, ret: DateTime<Utc>) -> RequestRow {
        RequestRow {
            request_id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            category: PassCategory::Outing,
            reason: "errand".to_string(),
            departure_at: departure,
            return_at: Some(ret),
            status,
            forwarded_to: None,
            verify_token: Some("tok".to_string()),
            created_at: departure - Duration::hours(12),
            updated_at: departure - Duration::hours(12),
        }
    }

    fn exit_log(request_id: Uuid, at: DateTime<Utc>) -> GateLogRow {
        GateLogRow {
            log_id: Uuid::new_v4(),
            request_id,
            action: GateEvent::Exit,
            gatekeeper_id: Uuid::new_v4(),
            logged_at: at,
        }
    }

    // ── Pure derivation ──

    #[test]
    fn ready_pass_in_window_allows_exit() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let r = request_in(RequestStatus::Ready, now - Duration::minutes(5), now + Duration::hours(4));
        let d = derive(&r, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::Ready);
        assert_eq!(d.allowed_actions, vec![GateEvent::Exit]);
        assert!(d.warning.is_none());
    }

    #[test]
    fn no_scan_and_internal_policies_bypass_the_gate() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let r = request_in(RequestStatus::Ready, now, now + Duration::hours(4));
        let d = derive(&r, StudentCategory::DayScholar, GateActionKind::NoScan, None, now, &config);
        assert_eq!(d.status, GateStatus::GateNotRequired);
        assert!(d.allowed_actions.is_empty());

        let d = derive(&r, StudentCategory::Resident, GateActionKind::InternalOnly, None, now, &config);
        assert_eq!(d.status, GateStatus::InternalOnly);
    }

    #[test]
    fn early_arrival_is_flagged_but_exit_allowed() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let r = request_in(RequestStatus::Ready, now + Duration::hours(3), now + Duration::hours(8));
        let d = derive(&r, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::TooEarly);
        assert_eq!(d.allowed_actions, vec![GateEvent::Exit]);
        assert!(d.warning.is_some());
    }

    #[test]
    fn late_departure_warns_for_ordinary_passes() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let r = request_in(RequestStatus::Ready, now - Duration::hours(1), now + Duration::hours(4));
        let d = derive(&r, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::Ready);
        assert_eq!(d.allowed_actions, vec![GateEvent::Exit]);
        assert!(d.warning.unwrap().contains("departure window passed"));
    }

    #[test]
    fn late_day_scholar_permission_expires_hard() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let mut r = request_in(RequestStatus::Ready, now - Duration::hours(1), now + Duration::hours(4));
        r.category = PassCategory::Permission;
        let d = derive(&r, StudentCategory::DayScholar, GateActionKind::ExitOnly, None, now, &config);
        assert_eq!(d.status, GateStatus::Expired);
        assert!(d.allowed_actions.is_empty());
    }

    #[test]
    fn emergency_grace_is_generous() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let mut r = request_in(RequestStatus::Ready, now - Duration::hours(12), now + Duration::hours(6));
        r.category = PassCategory::Emergency;
        let d = derive(&r, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::Ready);
        assert!(d.warning.is_none());
    }

    #[test]
    fn exited_pass_is_out_then_overdue() {
        let config = GatepassConfig::default();
        let now = Utc::now();
        let r = request_in(RequestStatus::Active, now - Duration::hours(3), now + Duration::hours(1));
        let log = exit_log(r.request_id, now - Duration::hours(3));
        let d = derive(&r, StudentCategory::Resident, GateActionKind::ScanBoth, Some(&log), now, &config);
        assert_eq!(d.status, GateStatus::Out);
        assert_eq!(d.allowed_actions, vec![GateEvent::Entry]);

        let overdue = request_in(RequestStatus::Active, now - Duration::hours(5), now - Duration::minutes(90));
        let log = exit_log(overdue.request_id, now - Duration::hours(5));
        let d = derive(&overdue, StudentCategory::Resident, GateActionKind::ScanBoth, Some(&log), now, &config);
        assert_eq!(d.status, GateStatus::Overdue { minutes: 90 });
        assert_eq!(d.allowed_actions, vec![GateEvent::Entry]);
    }

    #[test]
    fn spent_and_not_ready_passes_are_closed() {
        let config = GatepassConfig::default();
        let now = Utc::now();

        let done = request_in(RequestStatus::Completed, now - Duration::hours(6), now - Duration::hours(1));
        let d = derive(&done, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::Used);

        let pending = request_in(RequestStatus::Pending, now, now + Duration::hours(4));
        let d = derive(&pending, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::NotReady);

        let cancelled = request_in(RequestStatus::Cancelled, now, now + Duration::hours(4));
        let d = derive(&cancelled, StudentCategory::Resident, GateActionKind::ScanBoth, None, now, &config);
        assert_eq!(d.status, GateStatus::Expired);
    }

    // ── End-to-end over the store ──

    async fn approved_resident_pass(campus: &Campus) -> (RequestRow, Uuid) {
        let student = campus.add_resident(80).await;
        let lifecycle = campus.lifecycle();
        let row = lifecycle
            .create(NewRequest {
                student_id: student.student_id,
                category: PassCategory::Outing,
                reason: "errand".to_string(),
                departure_at: soon(1),
                return_at: Some(soon(6)),
            })
            .await
            .unwrap();
        lifecycle
            .decide_stage1(row.request_id, campus.mentor, Decision::Approve, None)
            .await
            .unwrap();
        lifecycle
            .decide_stage2(row.request_id, campus.head, Decision::Approve, None)
            .await
            .unwrap();
        let row = lifecycle
            .decide_stage3(row.request_id, campus.warden, Decision::Approve, None, false)
            .await
            .unwrap();
        (row, student.student_id)
    }

    #[tokio::test]
    async fn exit_then_entry_completes_a_two_scan_pass() {
        let campus = Campus::new().await;
        let (row, _) = approved_resident_pass(&campus).await;
        let gate = campus.gate();
        let now = Utc::now();

        let report = gate
            .verify(row.verify_token.as_deref().unwrap(), now)
            .await
            .unwrap();
        assert_eq!(report.decision.status, GateStatus::Ready);

        let report = gate
            .log_action(row.request_id, GateEvent::Exit, campus.gatekeeper, now)
            .await
            .unwrap();
        assert_eq!(report.request.status, RequestStatus::Active);
        assert_eq!(report.decision.status, GateStatus::Out);

        let report = gate
            .log_action(row.request_id, GateEvent::Entry, campus.gatekeeper, now + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report.request.status, RequestStatus::Completed);
        assert_eq!(report.decision.status, GateStatus::Used);
    }

    /// Scenario 1: day-scholar outing with an exit-only policy completes
    /// on the single exit scan after mentor + HOD approval.
    #[tokio::test]
    async fn exit_only_pass_completes_on_the_exit_scan() {
        let campus = Campus::new().await;
        campus
            .put_policy(PolicyRow {
                student_category: StudentCategory::DayScholar,
                pass_category: PassCategory::Outing,
                window_start_hour: None,
                window_end_hour: None,
                holiday_behavior: HolidayBehavior::Unrestricted,
                holiday_start_hour: None,
                holiday_end_hour: None,
                max_duration_hours: None,
                gate_action: GateActionKind::ExitOnly,
            })
            .await;

        let student = campus.add_day_scholar(80).await;
        let lifecycle = campus.lifecycle();
        let row = lifecycle
            .create(NewRequest {
                student_id: student.student_id,
                category: PassCategory::Outing,
                reason: "library run".to_string(),
                departure_at: soon(1),
                return_at: Some(soon(5)),
            })
            .await
            .unwrap();
        lifecycle
            .decide_stage1(row.request_id, campus.mentor, Decision::Approve, None)
            .await
            .unwrap();
        let row = lifecycle
            .decide_stage2(row.request_id, campus.head, Decision::Approve, None)
            .await
            .unwrap();
        assert_eq!(row.status, RequestStatus::Ready);

        let gate = campus.gate();
        let report = gate
            .log_action(row.request_id, GateEvent::Exit, campus.gatekeeper, Utc::now())
            .await
            .unwrap();
        assert_eq!(report.request.status, RequestStatus::Completed);
        assert_eq!(report.decision.status, GateStatus::Used);
    }

    #[tokio::test]
    async fn duplicate_scans_are_rejected() {
        let campus = Campus::new().await;
        let (row, _) = approved_resident_pass(&campus).await;
        let gate = campus.gate();
        let now = Utc::now();

        gate.log_action(row.request_id, GateEvent::Exit, campus.gatekeeper, now)
            .await
            .unwrap();
        let err = gate
            .log_action(row.request_id, GateEvent::Exit, campus.gatekeeper, now)
            .await
            .unwrap_err();
        assert!(matches!(err, PassError::Validation(msg) if msg.contains("duplicate")));

        gate.log_action(row.request_id, GateEvent::Entry, campus.gatekeeper, now)
            .await
            .unwrap();
        let err = gate
            .log_action(row.request_id, GateEvent::Entry, campus.gatekeeper, now)
            .await
            .unwrap_err();
        assert!(matches!(err, PassError::Validation(msg) if msg.contains("duplicate")));

        // Gate pairing held: exactly one exit and one entry.
        let logs = campus.store.gate_logs(row.request_id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, GateEvent::Exit);
        assert_eq!(logs[1].action, GateEvent::Entry);
    }

    /// Scenario 5: cancelling while physically out is refused without any
    /// mutation.
    #[tokio::test]
    async fn cancel_while_out_is_refused() {
        let campus = Campus::new().await;
        let (row, student_id) = approved_resident_pass(&campus).await;
        let gate = campus.gate();
        gate.log_action(row.request_id, GateEvent::Exit, campus.gatekeeper, Utc::now())
            .await
            .unwrap();

        let lifecycle = campus.lifecycle();
        let err = lifecycle.cancel(row.request_id, student_id).await.unwrap_err();
        assert!(matches!(err, PassError::Validation(_)));

        let after = campus.store.request(row.request_id).await.unwrap().unwrap();
        assert_eq!(after.status, RequestStatus::Active);
    }

    #[tokio::test]
    async fn entry_before_exit_is_a_conflict() {
        let campus = Campus::new().await;
        let (row, _) = approved_resident_pass(&campus).await;
        let gate = campus.gate();

        let err = gate
            .log_action(row.request_id, GateEvent::Entry, campus.gatekeeper, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, PassError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn unknown_identifier_is_rejected() {
        let campus = Campus::new().await;
        let gate = campus.gate();
        let err = gate.verify("not-a-token", Utc::now()).await.unwrap_err();
        assert!(matches!(err, PassError::Validation(_)));
    }
}
