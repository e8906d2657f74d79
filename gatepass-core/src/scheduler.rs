//! Expiration Scheduler
//!
//! Recurring sweep that closes out requests nobody acted on in time. Two
//! independent bulk corrections per tick:
//!   (a) return time passed while the pass never reached physical exit;
//!   (b) gate-ready passes whose departure is stale with no exit log.
//! Both select in bulk, transition in bulk, then notify per row. A failed
//! notification is logged and skipped, never aborts the batch. The tick
//! interval carries jitter so multiple instances do not stampede the
//! store together.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::GatepassConfig;
use crate::error::PassError;
use crate::model::RequestRow;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::store::PassStore;

/// Counts from one sweep pass, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub past_return: usize,
    pub stale_ready: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.past_return + self.stale_ready
    }
}

pub struct ExpirationScheduler {
    store: Arc<dyn PassStore>,
    notifier: Arc<dyn Notifier>,
    config: GatepassConfig,
}

impl ExpirationScheduler {
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

    /// Run until the shutdown signal flips. Decoupled from request
    /// handling; an error in one tick backs off and tries again.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval_secs,
            "expiration scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                info!("expiration scheduler shutting down");
                break;
            }

            match self.sweep_once().await {
                Ok(stats) if stats.total() > 0 => {
                    info!(
                        past_return = stats.past_return,
                        stale_ready = stats.stale_ready,
                        "expired stale requests"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_interval()) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("expiration scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn next_interval(&self) -> Duration {
        let jitter = if self.config.sweep_jitter_secs > 0 {
            rand::thread_rng().gen_range(0..=self.config.sweep_jitter_secs)
        } else {
            0
        };
        Duration::from_secs(self.config.sweep_interval_secs + jitter)
    }

    /// One sweep pass. Time-based predicates make this safe against
    /// concurrent approvals: a request whose return time has not passed is
    /// never touched.
    pub async fn sweep_once(&self) -> Result<SweepStats, PassError> {
        let now = Utc::now();

        let past_return = self.store.expire_past_return(now).await?;
        self.notify_all(&past_return, "scheduled return time passed without an exit")
            .await;

        let cutoff = now - ChronoDuration::hours(self.config.stale_departure_hours);
        let stale_ready = self.store.expire_stale_ready(cutoff, now).await?;
        self.notify_all(&stale_ready, "departure time passed without an exit")
            .await;

        Ok(SweepStats {
            past_return: past_return.len(),
            stale_ready: stale_ready.len(),
        })
    }

    async fn notify_all(&self, rows: &[RequestRow], why: &str) {
        for row in rows {
            let note = Notification::new(
                row.student_id,
                NotificationKind::PassExpired,
                Some(row.request_id),
                format!("Your {} pass expired: {why}", row.category),
            );
            if let Err(e) = self.notifier.publish(note).await {
                warn!(request_id = %row.request_id, error = %e, "expiry notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestRow;
    use crate::status::{PassCategory, RequestStatus};
    use crate::testutil::Campus;
    use chrono::{DateTime, Duration};
    use uuid::Uuid;

    async fn seed_request(
        campus: &Campus,
        status: RequestStatus,
        departure_at: DateTime<chrono::Utc>,
        return_at: DateTime<chrono::Utc>,
    ) -> RequestRow {
        let student = campus.add_resident(80).await;
        let row = RequestRow {
            request_id: Uuid::new_v4(),
            student_id: student.student_id,
            category: PassCategory::Outing,
            reason: "errand".to_string(),
            departure_at,
            return_at: Some(return_at),
            status,
            forwarded_to: None,
            verify_token: None,
            created_at: departure_at - Duration::hours(6),
            updated_at: departure_at - Duration::hours(6),
        };
        campus.store.insert_request(&row).await.unwrap();
        row
    }

    #[tokio::test]
    async fn pre_exit_requests_past_return_are_expired() {
        let campus = Campus::new().await;
        let now = Utc::now();
        let stale = seed_request(
            &campus,
            RequestStatus::Pending,
            now - Duration::hours(8),
            now - Duration::hours(2),
        )
        .await;
        let fresh = seed_request(
            &campus,
            RequestStatus::Recommended,
            now + Duration::hours(2),
            now + Duration::hours(6),
        )
        .await;

        let stats = campus.scheduler().sweep_once().await.unwrap();
        assert_eq!(stats.past_return, 1);

        let stale = campus.store.request(stale.request_id).await.unwrap().unwrap();
        assert_eq!(stale.status, RequestStatus::Expired);
        let fresh = campus.store.request(fresh.request_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, RequestStatus::Recommended);
    }

    /// Scenario 3: a gate-ready pass with a departure 3 hours past and no
    /// exit log is flipped to expired.
    #[tokio::test]
    async fn stale_ready_requests_are_expired() {
        let campus = Campus::new().await;
        let now = Utc::now();
        let stale = seed_request(
            &campus,
            RequestStatus::Ready,
            now - Duration::hours(3),
            now + Duration::hours(5),
        )
        .await;

        let stats = campus.scheduler().sweep_once().await.unwrap();
        assert_eq!(stats.stale_ready, 1);
        let row = campus.store.request(stale.request_id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Expired);
    }

    #[tokio::test]
    async fn exited_requests_are_left_alone() {
        let campus = Campus::new().await;
        let now = Utc::now();
        // Physically out and overdue: the sweep must not touch it, overdue
        // stays a derived state.
        let out = seed_request(
            &campus,
            RequestStatus::Active,
            now - Duration::hours(10),
            now - Duration::hours(4),
        )
        .await;
        campus
            .store
            .append_gate_log(&crate::model::GateLogRow {
                log_id: Uuid::new_v4(),
                request_id: out.request_id,
                action: crate::status::GateEvent::Exit,
                gatekeeper_id: Uuid::new_v4(),
                logged_at: now - Duration::hours(10),
            })
            .await
            .unwrap();

        let stats = campus.scheduler().sweep_once().await.unwrap();
        assert_eq!(stats.total(), 0);
        let row = campus.store.request(out.request_id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Active);
    }

    #[tokio::test]
    async fn ready_request_with_exit_log_is_not_stale() {
        let campus = Campus::new().await;
        let now = Utc::now();
        let row = seed_request(
            &campus,
            RequestStatus::Ready,
            now - Duration::hours(3),
            now + Duration::hours(5),
        )
        .await;
        campus
            .store
            .append_gate_log(&crate::model::GateLogRow {
                log_id: Uuid::new_v4(),
                request_id: row.request_id,
                action: crate::status::GateEvent::Exit,
                gatekeeper_id: Uuid::new_v4(),
                logged_at: now - Duration::hours(2),
            })
            .await
            .unwrap();

        let stats = campus.scheduler().sweep_once().await.unwrap();
        assert_eq!(stats.stale_ready, 0);
    }
}
