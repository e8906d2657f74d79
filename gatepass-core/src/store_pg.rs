//! Postgres store backend.
//!
//! All queries are runtime-checked `sqlx::query` / `query_as` rather than
//! the compile-time macros, because the schema is created by migrations
//! that may not exist at compile time (see `migrations/`).
//!
//! Enum columns are stored as text and parsed through the `FromStr` impls
//! on the status types, so the database and the state machine share one
//! vocabulary.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::model::*;
use crate::status::{PassCategory, RequestStatus, StudentCategory};
use crate::store::{PassStore, RequestEdit};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const REQUEST_COLUMNS: &str = "request_id, student_id, category, reason, departure_at, \
     return_at, status, forwarded_to, verify_token, created_at, updated_at";

fn request_from_row(row: &PgRow) -> Result<RequestRow> {
    Ok(RequestRow {
        request_id: row.try_get("request_id")?,
        student_id: row.try_get("student_id")?,
        category: row.try_get::<String, _>("category")?.parse()?,
        reason: row.try_get("reason")?,
        departure_at: row.try_get("departure_at")?,
        return_at: row.try_get("return_at")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        forwarded_to: row.try_get("forwarded_to")?,
        verify_token: row.try_get("verify_token")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn student_from_row(row: &PgRow) -> Result<StudentRow> {
    Ok(StudentRow {
        student_id: row.try_get("student_id")?,
        name: row.try_get("name")?,
        category: row.try_get::<String, _>("category")?.parse()?,
        active: row.try_get("active")?,
        trust_score: row.try_get("trust_score")?,
        pass_blocked: row.try_get("pass_blocked")?,
        cooldown_override_at: row.try_get("cooldown_override_at")?,
        year_of_study: row.try_get("year_of_study")?,
        mentor_id: row.try_get("mentor_id")?,
        department_id: row.try_get("department_id")?,
        hostel_id: row.try_get("hostel_id")?,
    })
}

fn gate_log_from_row(row: &PgRow) -> Result<GateLogRow> {
    Ok(GateLogRow {
        log_id: row.try_get("log_id")?,
        request_id: row.try_get("request_id")?,
        action: row.try_get::<String, _>("action")?.parse()?,
        gatekeeper_id: row.try_get("gatekeeper_id")?,
        logged_at: row.try_get("logged_at")?,
    })
}

fn delegation_from_row(row: &PgRow) -> Result<DelegationRow> {
    Ok(DelegationRow {
        delegation_id: row.try_get("delegation_id")?,
        authority_id: row.try_get("authority_id")?,
        delegate_id: row.try_get("delegate_id")?,
        starts_at: row.try_get("starts_at")?,
        ends_at: row.try_get("ends_at")?,
        active: row.try_get("active")?,
    })
}

fn hour(raw: Option<i32>) -> Option<u32> {
    raw.map(|h| h as u32)
}

#[async_trait]
impl PassStore for PgStore {
    async fn student(&self, id: Uuid) -> Result<Option<StudentRow>> {
        let row = sqlx::query(
            r#"
            SELECT student_id, name, category, active, trust_score, pass_blocked,
                   cooldown_override_at, year_of_study, mentor_id, department_id, hostel_id
            FROM gatepass.students
            WHERE student_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(student_from_row).transpose()
    }

    async fn update_trust_score(&self, id: Uuid, score: i32) -> Result<()> {
        sqlx::query("UPDATE gatepass.students SET trust_score = $2 WHERE student_id = $1")
            .bind(id)
            .bind(score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_pass_block(&self, id: Uuid, blocked: bool) -> Result<()> {
        sqlx::query("UPDATE gatepass.students SET pass_blocked = $2 WHERE student_id = $1")
            .bind(id)
            .bind(blocked)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_cooldown_override(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE gatepass.students SET cooldown_override_at = $2 WHERE student_id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn department_head(&self, department_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT head_id FROM gatepass.departments WHERE department_id = $1")
            .bind(department_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("head_id")))
    }

    async fn hostel_warden(&self, hostel_id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT warden_id FROM gatepass.hostels WHERE hostel_id = $1")
            .bind(hostel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("warden_id")))
    }

    async fn has_active_restriction(&self, student: &StudentRow, on: NaiveDate) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM gatepass.restrictions
                WHERE (department_id IS NULL OR department_id = $1)
                  AND (year_of_study IS NULL OR year_of_study = $2)
                  AND starts_on <= $3 AND ends_on >= $3
            ) AS hit
            "#,
        )
        .bind(student.department_id)
        .bind(student.year_of_study)
        .bind(on)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("hit"))
    }

    async fn insert_request(&self, row: &RequestRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gatepass.requests
                (request_id, student_id, category, reason, departure_at, return_at,
                 status, forwarded_to, verify_token, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.request_id)
        .bind(row.student_id)
        .bind(row.category.as_str())
        .bind(&row.reason)
        .bind(row.departure_at)
        .bind(row.return_at)
        .bind(row.status.as_str())
        .bind(row.forwarded_to)
        .bind(&row.verify_token)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn request(&self, id: Uuid) -> Result<Option<RequestRow>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM gatepass.requests WHERE request_id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn request_by_token(&self, token: &str) -> Result<Option<RequestRow>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM gatepass.requests WHERE verify_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn open_request_for(&self, student_id: Uuid) -> Result<Option<RequestRow>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM gatepass.requests
            WHERE student_id = $1
              AND status NOT IN ('completed', 'rejected', 'cancelled', 'expired')
            LIMIT 1
            "#
        ))
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn requests_in_status(&self, statuses: &[RequestStatus]) -> Result<Vec<RequestRow>> {
        let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REQUEST_COLUMNS} FROM gatepass.requests
            WHERE status = ANY($1)
            ORDER BY created_at
            "#
        ))
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn transition_request(
        &self,
        id: Uuid,
        expected: RequestStatus,
        next: RequestStatus,
        token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE gatepass.requests
            SET status = $3,
                verify_token = COALESCE($4, verify_token),
                updated_at = $5
            WHERE request_id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_request_fields(
        &self,
        id: Uuid,
        expected: RequestStatus,
        edit: &RequestEdit,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE gatepass.requests
            SET category = $3, reason = $4, departure_at = $5, return_at = $6, updated_at = $7
            WHERE request_id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(edit.category.as_str())
        .bind(&edit.reason)
        .bind(edit.departure_at)
        .bind(edit.return_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_forwarded_to(&self, id: Uuid, forwarded_to: Option<Uuid>) -> Result<()> {
        sqlx::query("UPDATE gatepass.requests SET forwarded_to = $2 WHERE request_id = $1")
            .bind(id)
            .bind(forwarded_to)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_cancellations_since(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM gatepass.requests
            WHERE student_id = $1 AND status = 'cancelled' AND updated_at >= $2
            "#,
        )
        .bind(student_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn count_requests_between(
        &self,
        student_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM gatepass.requests
            WHERE student_id = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(student_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn expire_past_return(&self, now: DateTime<Utc>) -> Result<Vec<RequestRow>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE gatepass.requests
            SET status = 'expired', updated_at = $1
            WHERE status IN ('pending', 'recommended', 'approved', 'ready')
              AND return_at IS NOT NULL AND return_at < $1
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn expire_stale_ready(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestRow>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE gatepass.requests r
            SET status = 'expired', updated_at = $2
            WHERE r.status = 'ready'
              AND r.departure_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM gatepass.gate_logs g
                  WHERE g.request_id = r.request_id AND g.action = 'exit'
              )
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }

    async fn latest_gate_log(&self, request_id: Uuid) -> Result<Option<GateLogRow>> {
        let row = sqlx::query(
            r#"
            SELECT log_id, request_id, action, gatekeeper_id, logged_at
            FROM gatepass.gate_logs
            WHERE request_id = $1
            ORDER BY logged_at DESC
            LIMIT 1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(gate_log_from_row).transpose()
    }

    async fn gate_logs(&self, request_id: Uuid) -> Result<Vec<GateLogRow>> {
        let rows = sqlx::query(
            r#"
            SELECT log_id, request_id, action, gatekeeper_id, logged_at
            FROM gatepass.gate_logs
            WHERE request_id = $1
            ORDER BY logged_at
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(gate_log_from_row).collect()
    }

    async fn append_gate_log(&self, row: &GateLogRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gatepass.gate_logs (log_id, request_id, action, gatekeeper_id, logged_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.log_id)
        .bind(row.request_id)
        .bind(row.action.as_str())
        .bind(row.gatekeeper_id)
        .bind(row.logged_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn policy(
        &self,
        student: StudentCategory,
        pass: PassCategory,
    ) -> Result<Option<PolicyRow>> {
        let row = sqlx::query(
            r#"
            SELECT student_category, pass_category, window_start_hour, window_end_hour,
                   holiday_behavior, holiday_start_hour, holiday_end_hour,
                   max_duration_hours, gate_action
            FROM gatepass.policies
            WHERE student_category = $1 AND pass_category = $2
            "#,
        )
        .bind(student.as_str())
        .bind(pass.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(PolicyRow {
                student_category: r.try_get::<String, _>("student_category")?.parse()?,
                pass_category: r.try_get::<String, _>("pass_category")?.parse()?,
                window_start_hour: hour(r.try_get("window_start_hour")?),
                window_end_hour: hour(r.try_get("window_end_hour")?),
                holiday_behavior: r.try_get::<String, _>("holiday_behavior")?.parse()?,
                holiday_start_hour: hour(r.try_get("holiday_start_hour")?),
                holiday_end_hour: hour(r.try_get("holiday_end_hour")?),
                max_duration_hours: r.try_get("max_duration_hours")?,
                gate_action: r.try_get::<String, _>("gate_action")?.parse()?,
            })
        })
        .transpose()
    }

    async fn is_calendar_exception(&self, date: NaiveDate) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM gatepass.calendar_exceptions WHERE day = $1) AS hit",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("hit"))
    }

    async fn on_approved_leave(&self, actor_id: Uuid, on: NaiveDate) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM gatepass.leave_records
                WHERE actor_id = $1 AND approved AND starts_on <= $2 AND ends_on >= $2
            ) AS hit
            "#,
        )
        .bind(actor_id)
        .bind(on)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("hit"))
    }

    async fn active_delegation_for(
        &self,
        authority_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegationRow>> {
        let row = sqlx::query(
            r#"
            SELECT delegation_id, authority_id, delegate_id, starts_at, ends_at, active
            FROM gatepass.delegations
            WHERE authority_id = $1 AND active AND starts_at <= $2 AND ends_at > $2
            LIMIT 1
            "#,
        )
        .bind(authority_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(delegation_from_row).transpose()
    }

    async fn is_delegate_of(
        &self,
        actor_id: Uuid,
        authority_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM gatepass.delegations
                WHERE authority_id = $1 AND delegate_id = $2
                  AND active AND starts_at <= $3 AND ends_at > $3
            ) AS hit
            "#,
        )
        .bind(authority_id)
        .bind(actor_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("hit"))
    }

    async fn activate_delegation(&self, row: &DelegationRow) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE gatepass.delegations SET active = FALSE WHERE authority_id = $1 AND active")
            .bind(row.authority_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO gatepass.delegations
                (delegation_id, authority_id, delegate_id, starts_at, ends_at, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.delegation_id)
        .bind(row.authority_id)
        .bind(row.delegate_id)
        .bind(row.starts_at)
        .bind(row.ends_at)
        .bind(row.active)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_trust_adjustment(&self, row: &TrustAdjustmentRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gatepass.trust_adjustments
                (adjustment_id, student_id, adjusted_by, old_score, new_score, delta,
                 reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.adjustment_id)
        .bind(row.student_id)
        .bind(&row.adjusted_by)
        .bind(row.old_score)
        .bind(row.new_score)
        .bind(row.delta)
        .bind(&row.reason)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trust_history(&self, student_id: Uuid) -> Result<Vec<TrustAdjustmentRow>> {
        let rows = sqlx::query(
            r#"
            SELECT adjustment_id, student_id, adjusted_by, old_score, new_score, delta,
                   reason, created_at
            FROM gatepass.trust_adjustments
            WHERE student_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(TrustAdjustmentRow {
                    adjustment_id: r.try_get("adjustment_id")?,
                    student_id: r.try_get("student_id")?,
                    adjusted_by: r.try_get("adjusted_by")?,
                    old_score: r.try_get("old_score")?,
                    new_score: r.try_get("new_score")?,
                    delta: r.try_get("delta")?,
                    reason: r.try_get("reason")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }
}
