//! Results of an auto-destroy scan cycle

use chrono::{DateTime, Utc};
use labhub_api::ServerStatus;
use labhub_util::UserPrincipalName;

/// Why a server survived a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetainReason {
    /// Owner opted out of reclamation
    AutoDestroyDisabled,
    /// Only Running servers are reclaimed
    NotRunning(ServerStatus),
    /// Last activity is within the inactivity threshold
    RecentlyActive,
    /// Live probe found user sessions
    ActiveSessions,
}

/// What a scan did with one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Retained(RetainReason),

    /// Container group deleted and record marked AutoDestroyed
    AutoDestroyed { idle_minutes: i64 },

    /// `last_user_activity_time` could not be parsed; skipped this cycle
    UnparseableActivity { error: String },

    /// Live probe failed; treated as not idle
    ProbeFailed { error: String },

    /// Provider teardown failed; record left untouched
    TeardownFailed { error: String },

    /// Container group deleted but the record still says Running
    ReconciliationGap { error: String },

    /// An earlier reconciliation gap was closed
    Reconciled,
}

impl ScanOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ScanOutcome::UnparseableActivity { .. }
                | ScanOutcome::ProbeFailed { .. }
                | ScanOutcome::TeardownFailed { .. }
                | ScanOutcome::ReconciliationGap { .. }
        )
    }
}

/// Summary of one scan cycle
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub outcomes: Vec<(UserPrincipalName, ScanOutcome)>,
    /// Cancellation arrived before every server was evaluated
    pub interrupted: bool,
}

impl ScanReport {
    pub fn new(scanned_at: DateTime<Utc>) -> Self {
        Self {
            scanned_at,
            outcomes: Vec::new(),
            interrupted: false,
        }
    }

    pub fn record(&mut self, user_principal_name: UserPrincipalName, outcome: ScanOutcome) {
        self.outcomes.push((user_principal_name, outcome));
    }

    pub fn outcome_for(&self, user_principal_name: &UserPrincipalName) -> Option<&ScanOutcome> {
        self.outcomes
            .iter()
            .find(|(upn, _)| upn == user_principal_name)
            .map(|(_, outcome)| outcome)
    }

    pub fn destroyed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ScanOutcome::AutoDestroyed { .. } | ScanOutcome::Reconciled))
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failure()).count()
    }
}
