//! Trust Ledger
//!
//! Bounded reputation score per student with an append-only audit trail.
//! Every adjustment clamps to 0..=100, records a TrustAdjustment row and
//! notifies the student. The cooldown rule is separate from scoring: it
//! counts recent cancellations and blocks new requests at the limit.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::GatepassConfig;
use crate::error::PassError;
use crate::model::{StudentRow, TrustAdjustmentRow};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::store::PassStore;

pub const TRUST_FLOOR: i32 = 0;
pub const TRUST_CEILING: i32 = 100;

/// Actor name recorded for rule-driven adjustments.
pub const SYSTEM_ACTOR: &str = "system";

pub struct TrustLedger {
    store: Arc<dyn PassStore>,
    notifier: Arc<dyn Notifier>,
    config: GatepassConfig,
}

impl TrustLedger {
    pub fn new(
        store: Arc<dyn PassStore>,
        notifier: Arc<dyn Notifier>,
        config: GatepassConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Apply a delta, clamped to the 0..=100 band. Appends an audit row and
    /// notifies the student. Returns the new score.
    pub async fn adjust(
        &self,
        student_id: Uuid,
        delta: i32,
        reason: &str,
        adjusted_by: &str,
    ) -> Result<i32, PassError> {
        let student = self
            .store
            .student(student_id)
            .await?
            .ok_or(PassError::NotFound("student", student_id))?;

        let old_score = student.trust_score;
        let new_score = (old_score + delta).clamp(TRUST_FLOOR, TRUST_CEILING);

        self.store.update_trust_score(student_id, new_score).await?;
        self.store
            .append_trust_adjustment(&TrustAdjustmentRow {
                adjustment_id: Uuid::new_v4(),
                student_id,
                adjusted_by: adjusted_by.to_string(),
                old_score,
                new_score,
                delta,
                reason: reason.to_string(),
                created_at: Utc::now(),
            })
            .await?;

        info!(
            student_id = %student_id,
            old_score,
            new_score,
            reason,
            "trust score adjusted"
        );

        let note = Notification::new(
            student_id,
            NotificationKind::TrustAdjusted,
            None,
            format!("Trust score changed {old_score} -> {new_score}: {reason}"),
        );
        if let Err(e) = self.notifier.publish(note).await {
            tracing::warn!(student_id = %student_id, error = %e, "trust notification failed");
        }

        Ok(new_score)
    }

    /// Cancellations counted toward the cooldown: inside the rolling window,
    /// and never before a manually set override timestamp.
    pub async fn cancellations_in_window(
        &self,
        student: &StudentRow,
        now: DateTime<Utc>,
    ) -> Result<i64, PassError> {
        let mut since = now - Duration::hours(self.config.cooldown_window_hours);
        if let Some(override_at) = student.cooldown_override_at {
            if override_at > since {
                since = override_at;
            }
        }
        Ok(self
            .store
            .count_cancellations_since(student.student_id, since)
            .await?)
    }

    /// Whether the cooldown currently blocks new requests for this student.
    pub async fn cooldown_tripped(
        &self,
        student: &StudentRow,
        now: DateTime<Utc>,
    ) -> Result<bool, PassError> {
        let count = self.cancellations_in_window(student, now).await?;
        Ok(count >= self.config.cooldown_cancel_limit)
    }

    /// Authority action: reset the cancellation history to "now", lifting
    /// an active cooldown immediately.
    pub async fn reset_cooldown(&self, student_id: Uuid) -> Result<(), PassError> {
        if self.store.student(student_id).await?.is_none() {
            return Err(PassError::NotFound("student", student_id));
        }
        self.store
            .set_cooldown_override(student_id, Utc::now())
            .await?;
        info!(student_id = %student_id, "cooldown override reset");
        Ok(())
    }

    /// Full audit trail for a student.
    pub async fn history(&self, student_id: Uuid) -> Result<Vec<TrustAdjustmentRow>, PassError> {
        Ok(self.store.trust_history(student_id).await?)
    }
}
