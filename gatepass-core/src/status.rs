//! Pass Status Machine
//!
//! One explicit finite-state-machine type with an exhaustive transition
//! table. Every mutation of a request's status goes through this table;
//! callers never issue ad hoc status strings.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle status of a pass request.
///
/// `overdue` is intentionally absent: it is a derived view of `Active`
/// past its return time, computed by the gate verifier, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Submitted, waiting on the stage-1 authority (mentor).
    Pending,
    /// Stage-1 approved, waiting on the stage-2 authority (department head).
    Recommended,
    /// Stage-2 approved, resident route, waiting on the hostel warden.
    Approved,
    /// Final approval granted; pass is gate-ready.
    Ready,
    /// Exit recorded; student is physically out.
    Active,
    Completed,
    Rejected,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Recommended => "recommended",
            Self::Approved => "approved",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Expired
        )
    }

    /// States that can still be force-expired by the sweep: approved in some
    /// form but never physically exited.
    pub fn is_pre_exit(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Recommended | Self::Approved | Self::Ready
        )
    }

    /// The exhaustive transition table. Forward edges follow the approval
    /// chain; `Rejected`, `Cancelled` and `Expired` branch off every
    /// non-terminal state. Terminal states admit nothing.
    pub fn can_transition_to(&self, target: RequestStatus) -> bool {
        use RequestStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, target) {
            (Pending, Recommended) => true,
            // Day-scholars go gate-ready straight from stage 2; residents
            // route through the warden first.
            (Recommended, Approved | Ready) => true,
            (Approved, Ready) => true,
            // Exit-only passes complete on the single exit scan.
            (Ready, Active | Completed) => true,
            (Active, Completed) => true,
            (_, Rejected | Cancelled | Expired) => true,
            _ => false,
        }
    }
}

impl FromStr for RequestStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "recommended" => Ok(Self::Recommended),
            "approved" => Ok(Self::Approved),
            "ready" => Ok(Self::Ready),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(StatusParseError::Unknown(s.to_string())),
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusParseError {
    #[error("unknown request status: {0}")]
    Unknown(String),
}

/// Category of the pass being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassCategory {
    Outing,
    Leave,
    OnDuty,
    Emergency,
    Permission,
}

impl PassCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outing => "outing",
            Self::Leave => "leave",
            Self::OnDuty => "on_duty",
            Self::Emergency => "emergency",
            Self::Permission => "permission",
        }
    }
}

impl FromStr for PassCategory {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outing" => Ok(Self::Outing),
            "leave" => Ok(Self::Leave),
            "on_duty" => Ok(Self::OnDuty),
            "emergency" => Ok(Self::Emergency),
            "permission" => Ok(Self::Permission),
            _ => Err(StatusParseError::Unknown(s.to_string())),
        }
    }
}

impl std::fmt::Display for PassCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Residency category of the requesting student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentCategory {
    DayScholar,
    Resident,
}

impl StudentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DayScholar => "day_scholar",
            Self::Resident => "resident",
        }
    }
}

impl FromStr for StudentCategory {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day_scholar" => Ok(Self::DayScholar),
            "resident" => Ok(Self::Resident),
            _ => Err(StatusParseError::Unknown(s.to_string())),
        }
    }
}

/// Physical scanning requirement a policy attaches to a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateActionKind {
    /// No physical scan at all.
    NoScan,
    /// Single exit scan; the pass completes on exit.
    ExitOnly,
    /// Standard exit + entry pair.
    ScanBoth,
    /// Resident internal movement, not a campus exit.
    InternalOnly,
}

impl GateActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoScan => "no_scan",
            Self::ExitOnly => "exit_only",
            Self::ScanBoth => "scan_both",
            Self::InternalOnly => "internal_only",
        }
    }
}

impl FromStr for GateActionKind {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_scan" => Ok(Self::NoScan),
            "exit_only" => Ok(Self::ExitOnly),
            "scan_both" => Ok(Self::ScanBoth),
            "internal_only" => Ok(Self::InternalOnly),
            _ => Err(StatusParseError::Unknown(s.to_string())),
        }
    }
}

/// A physical event recorded at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateEvent {
    Exit,
    Entry,
}

impl GateEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::Entry => "entry",
        }
    }
}

impl FromStr for GateEvent {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit" => Ok(Self::Exit),
            "entry" => Ok(Self::Entry),
            _ => Err(StatusParseError::Unknown(s.to_string())),
        }
    }
}

impl std::fmt::Display for GateEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a policy treats departures on holidays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolidayBehavior {
    Block,
    CustomWindow,
    Unrestricted,
}

impl HolidayBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::CustomWindow => "custom_window",
            Self::Unrestricted => "unrestricted",
        }
    }
}

impl FromStr for HolidayBehavior {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "custom_window" => Ok(Self::CustomWindow),
            "unrestricted" => Ok(Self::Unrestricted),
            _ => Err(StatusParseError::Unknown(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_admit_nothing() {
        use RequestStatus::*;
        let all = [
            Pending, Recommended, Approved, Ready, Active, Completed, Rejected, Cancelled, Expired,
        ];
        for terminal in [Completed, Rejected, Cancelled, Expired] {
            for target in all {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal} must not reach {target}"
                );
            }
        }
    }

    #[test]
    fn forward_chain_is_exact() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Recommended));
        assert!(!Pending.can_transition_to(Approved));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Pending.can_transition_to(Active));
        assert!(Recommended.can_transition_to(Approved));
        assert!(Recommended.can_transition_to(Ready));
        assert!(!Recommended.can_transition_to(Active));
        assert!(Approved.can_transition_to(Ready));
        assert!(!Approved.can_transition_to(Active));
        assert!(Ready.can_transition_to(Active));
        assert!(Ready.can_transition_to(Completed));
        assert!(Active.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Ready));
    }

    #[test]
    fn side_branches_reachable_from_every_non_terminal() {
        use RequestStatus::*;
        for from in [Pending, Recommended, Approved, Ready, Active] {
            assert!(from.can_transition_to(Rejected));
            assert!(from.can_transition_to(Cancelled));
            assert!(from.can_transition_to(Expired));
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        use RequestStatus::*;
        for s in [
            Pending, Recommended, Approved, Ready, Active, Completed, Rejected, Cancelled, Expired,
        ] {
            assert_eq!(s.as_str().parse::<RequestStatus>().unwrap(), s);
        }
    }
}
