//! Shared fixtures for the test suite: a small campus with one department,
//! one hostel, and the usual cast of approvers, wired over `MemoryStore`.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::GatepassConfig;
use crate::gate::GateVerifier;
use crate::lifecycle::RequestLifecycle;
use crate::model::{PolicyRow, StudentRow};
use crate::notify::TracingNotifier;
use crate::scheduler::ExpirationScheduler;
use crate::status::StudentCategory;
use crate::store_memory::MemoryStore;

pub struct Campus {
    pub store: Arc<MemoryStore>,
    pub config: GatepassConfig,
    pub mentor: Uuid,
    pub head: Uuid,
    pub warden: Uuid,
    pub gatekeeper: Uuid,
    pub department_id: Uuid,
    pub hostel_id: Uuid,
}

impl Campus {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let department_id = Uuid::new_v4();
        let hostel_id = Uuid::new_v4();
        let head = Uuid::new_v4();
        let warden = Uuid::new_v4();
        store.put_department_head(department_id, head).await;
        store.put_hostel_warden(hostel_id, warden).await;
        Self {
            store,
            config: GatepassConfig::default(),
            mentor: Uuid::new_v4(),
            head,
            warden,
            gatekeeper: Uuid::new_v4(),
            department_id,
            hostel_id,
        }
    }

    pub async fn add_resident(&self, trust: i32) -> StudentRow {
        let row = StudentRow {
            student_id: Uuid::new_v4(),
            name: "Meena Pillai".to_string(),
            category: StudentCategory::Resident,
            active: true,
            trust_score: trust,
            pass_blocked: false,
            cooldown_override_at: None,
            year_of_study: 2,
            mentor_id: self.mentor,
            department_id: self.department_id,
            hostel_id: Some(self.hostel_id),
        };
        self.store.put_student(row.clone()).await;
        row
    }

    pub async fn add_day_scholar(&self, trust: i32) -> StudentRow {
        let row = StudentRow {
            student_id: Uuid::new_v4(),
            name: "Arjun Nair".to_string(),
            category: StudentCategory::DayScholar,
            active: true,
            trust_score: trust,
            pass_blocked: false,
            cooldown_override_at: None,
            year_of_study: 3,
            mentor_id: self.mentor,
            department_id: self.department_id,
            hostel_id: None,
        };
        self.store.put_student(row.clone()).await;
        row
    }

    pub async fn put_policy(&self, row: PolicyRow) {
        self.store.put_policy(row).await;
    }

    pub fn lifecycle(&self) -> RequestLifecycle {
        RequestLifecycle::new(
            self.store.clone(),
            Arc::new(TracingNotifier),
            self.config.clone(),
        )
    }

    pub fn gate(&self) -> GateVerifier {
        GateVerifier::new(
            self.store.clone(),
            Arc::new(TracingNotifier),
            self.config.clone(),
        )
    }

    pub fn scheduler(&self) -> ExpirationScheduler {
        ExpirationScheduler::new(
            self.store.clone(),
            Arc::new(TracingNotifier),
            self.config.clone(),
        )
    }

}

/// A departure comfortably inside the creation bounds.
pub fn soon(hours: i64) -> DateTime<Utc> {
    Utc::now() + Duration::hours(hours)
}
