//! Legacy default policies.
//!
//! Single deterministic provider for (category, pass category) pairings
//! with no configured policy row. Kept in its own module so it can be
//! retired once policy coverage is complete; when a configured row exists
//! it is always authoritative and this module is never consulted.

use crate::model::PolicyRow;
use crate::status::{GateActionKind, HolidayBehavior, PassCategory, StudentCategory};

/// The minimal legacy rule set: unrestricted windows, no duration cap,
/// gate action by pairing.
pub fn default_policy(student: StudentCategory, pass: PassCategory) -> PolicyRow {
    let gate_action = match (student, pass) {
        (StudentCategory::DayScholar, PassCategory::Leave | PassCategory::OnDuty) => {
            GateActionKind::NoScan
        }
        (StudentCategory::DayScholar, PassCategory::Permission) => GateActionKind::ExitOnly,
        (StudentCategory::Resident, PassCategory::Permission) => GateActionKind::InternalOnly,
        _ => GateActionKind::ScanBoth,
    };
    PolicyRow {
        student_category: student,
        pass_category: pass,
        window_start_hour: None,
        window_end_hour: None,
        holiday_behavior: HolidayBehavior::Unrestricted,
        holiday_start_hour: None,
        holiday_end_hour: None,
        max_duration_hours: None,
        gate_action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_gate_actions() {
        assert_eq!(
            default_policy(StudentCategory::DayScholar, PassCategory::Leave).gate_action,
            GateActionKind::NoScan
        );
        assert_eq!(
            default_policy(StudentCategory::DayScholar, PassCategory::Permission).gate_action,
            GateActionKind::ExitOnly
        );
        assert_eq!(
            default_policy(StudentCategory::Resident, PassCategory::Permission).gate_action,
            GateActionKind::InternalOnly
        );
        assert_eq!(
            default_policy(StudentCategory::Resident, PassCategory::Outing).gate_action,
            GateActionKind::ScanBoth
        );
    }
}
