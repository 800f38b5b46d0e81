//! Provisioning job tracking.
//!
//! A job represents one end-to-end installation attempt for a domain,
//! capturing:
//!
//! - **Steps**: The ordered step sequence and its per-step state
//! - **Reservation**: The ledger entry holding the partner's credits
//! - **Timing**: When the job was created and completed
//! - **Outcome**: Terminal state plus a structured failure report
//!
//! The job record is exclusively owned by its orchestrator for the job's
//! lifetime; observers read point-in-time snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use steward_core::{JobId, LedgerEntryId, PartnerId};

use crate::error::{Error, Result};
use crate::step::{SourceKind, StepKey};
use crate::tracker::StepTracker;

/// Job state machine states.
///
/// ```text
/// IDLE -> RESERVING -> RUNNING -> FINALIZING -> COMPLETED
///             |            |           |
///             +------------+-----------+--> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Created, nothing has happened yet.
    Idle,
    /// Acquiring the credit reservation.
    Reserving,
    /// Executing the step sequence.
    Running,
    /// All steps succeeded; settling the reservation.
    Finalizing,
    /// Terminal success; the charge is permanent.
    Completed,
    /// Terminal failure; any held reservation was compensated.
    Failed,
}

impl JobState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Idle => matches!(target, Self::Reserving | Self::Failed),
            Self::Reserving => matches!(target, Self::Running | Self::Failed),
            Self::Running => matches!(target, Self::Finalizing | Self::Failed),
            Self::Finalizing => matches!(target, Self::Completed | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Reserving => "reserving",
            Self::Running => "running",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Reserving => write!(f, "RESERVING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Finalizing => write!(f, "FINALIZING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Caller-facing terminal failure payload.
///
/// Carries the failing step, a machine-readable code, a human message,
/// bounded diagnostic tails, and a suggested remediation category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    /// The step that failed, if the failure is attributable to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepKey>,
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Bounded tail of the failed operation's stdout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_tail: Option<String>,
    /// Bounded tail of the failed operation's stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    /// Suggested remediation category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl FailureReport {
    /// Builds a report from a provisioning error.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        let (step, stdout_tail, stderr_tail) = match error {
            Error::StepExecution {
                step,
                stdout_tail,
                stderr_tail,
                ..
            } => (Some(*step), stdout_tail.clone(), stderr_tail.clone()),
            Error::Timeout { step, .. } | Error::Spawn { step, .. } => (Some(*step), None, None),
            _ => (None, None, None),
        };
        Self {
            step,
            code: error.code().to_string(),
            message: error.to_string(),
            stdout_tail,
            stderr_tail,
            remediation: error.remediation().map(|r| format!("{r:?}")),
        }
    }
}

/// One end-to-end installation attempt, keyed by target domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// The domain being provisioned. Also the job's mutual-exclusion key.
    pub domain: String,
    /// The partner paying for the installation.
    pub partner_id: PartnerId,
    /// Where the application sources come from.
    pub source: SourceKind,
    /// Overall job state.
    pub state: JobState,
    /// Ordered step list and per-step state.
    pub tracker: StepTracker,
    /// The held reservation's ledger entry, once granted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_ledger_id: Option<LedgerEntryId>,
    /// Whether the reservation has been settled (committed or cancelled).
    #[serde(default)]
    pub reservation_settled: bool,
    /// Terminal failure payload, if the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time the job made observable progress. Feeds the lease sweep.
    pub last_heartbeat: DateTime<Utc>,
}

impl Job {
    /// Creates a new idle job for the given domain.
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        partner_id: PartnerId,
        source: SourceKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            domain: domain.into(),
            partner_id,
            source,
            state: JobState::Idle,
            tracker: StepTracker::new(source),
            reservation_ledger_id: None,
            reservation_settled: false,
            failure: None,
            created_at: now,
            completed_at: None,
            last_heartbeat: now,
        }
    }

    /// Transitions the job to a new state, validating the state machine.
    ///
    /// Terminal transitions record the completion timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is not
    /// legal from the current state.
    pub fn transition(&mut self, target: JobState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "job state machine violation".into(),
            });
        }
        self.state = target;
        self.record_heartbeat();
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Records that the job made observable progress.
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Returns true if the job went quiet past the lease window at `now`.
    ///
    /// Terminal jobs are never stale; their reservation is already
    /// settled.
    #[must_use]
    pub fn is_lease_expired_at(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        now.signed_duration_since(self.last_heartbeat) > lease
    }

    /// Returns true if the job holds a reservation that has not yet been
    /// committed or cancelled.
    #[must_use]
    pub const fn holds_unsettled_reservation(&self) -> bool {
        self.reservation_ledger_id.is_some() && !self.reservation_settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("shop.example.com", PartnerId::generate(), SourceKind::Package)
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = job();
        job.transition(JobState::Reserving).unwrap();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Finalizing).unwrap();
        job.transition(JobState::Completed).unwrap();
        assert!(job.state.is_terminal());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut job = job();
        job.transition(JobState::Reserving).unwrap();
        job.transition(JobState::Failed).unwrap();
        assert!(job.transition(JobState::Running).is_err());
        assert!(job.transition(JobState::Completed).is_err());
    }

    #[test]
    fn cannot_skip_reserving() {
        let mut job = job();
        assert!(job.transition(JobState::Running).is_err());
    }

    #[test]
    fn lease_expiry_tracks_heartbeat() {
        let mut job = job();
        job.transition(JobState::Reserving).unwrap();
        let lease = chrono::Duration::minutes(5);
        assert!(!job.is_lease_expired_at(Utc::now(), lease));
        let later = Utc::now() + chrono::Duration::minutes(6);
        assert!(job.is_lease_expired_at(later, lease));

        job.record_heartbeat();
        assert!(!job.is_lease_expired_at(Utc::now(), lease));
    }

    #[test]
    fn terminal_jobs_never_expire() {
        let mut job = job();
        job.transition(JobState::Reserving).unwrap();
        job.transition(JobState::Failed).unwrap();
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(!job.is_lease_expired_at(later, chrono::Duration::minutes(5)));
    }

    #[test]
    fn failure_report_carries_step_diagnostics() {
        let err = Error::StepExecution {
            step: StepKey::CompileApplication,
            message: "linker exited with status 1".into(),
            stdout_tail: Some("compiling...".into()),
            stderr_tail: Some("undefined reference".into()),
        };
        let report = FailureReport::from_error(&err);
        assert_eq!(report.step, Some(StepKey::CompileApplication));
        assert_eq!(report.code, "STEP_FAILED");
        assert!(report.stderr_tail.is_some());
    }
}
