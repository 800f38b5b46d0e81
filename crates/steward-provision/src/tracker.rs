//! Step bookkeeping for one job.
//!
//! [`StepTracker`] is an explicit finite-state machine holding the ordered
//! step list and a `transition(event)` function, decoupled from any
//! presentation concern and from the steps' actual side effects. It is
//! mutated only by the orchestrator thread of control for its job and read
//! by observers through snapshots.
//!
//! Enforced invariants:
//!
//! - steps start in sequence order, each only after its predecessor
//!   succeeded
//! - at most one step is `Running` at any instant
//! - once a step is `Error`, no later step ever leaves `Pending`

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::step::{step_sequence, SourceKind, StepKey, StepRecord, StepStatus};

/// An observed step lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// The step began executing.
    Started {
        /// The step that started.
        key: StepKey,
    },
    /// The running step reported incremental progress.
    Progress {
        /// The step reporting progress.
        key: StepKey,
        /// Reported completion percent (0-100).
        percent: u8,
    },
    /// The running step completed successfully.
    Succeeded {
        /// The step that succeeded.
        key: StepKey,
    },
    /// The running step failed.
    Failed {
        /// The step that failed.
        key: StepKey,
        /// Error message from the step's operation.
        message: String,
    },
}

impl StepEvent {
    /// Returns the step this event concerns.
    #[must_use]
    pub const fn key(&self) -> StepKey {
        match self {
            Self::Started { key }
            | Self::Progress { key, .. }
            | Self::Succeeded { key }
            | Self::Failed { key, .. } => *key,
        }
    }
}

/// Ordered step list plus derived progress for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepTracker {
    steps: Vec<StepRecord>,
}

impl StepTracker {
    /// Creates a tracker with the fixed step sequence for the given source
    /// kind, all steps pending.
    #[must_use]
    pub fn new(kind: SourceKind) -> Self {
        Self::from_keys(step_sequence(kind))
    }

    /// Creates a tracker from an explicit step list. Intended for tests
    /// that want shorter sequences.
    #[must_use]
    pub fn from_keys(keys: Vec<StepKey>) -> Self {
        Self {
            steps: keys.into_iter().map(StepRecord::new).collect(),
        }
    }

    /// Returns the step records in sequence order.
    #[must_use]
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Returns the total number of steps.
    #[must_use]
    pub fn total(&self) -> usize {
        self.steps.len()
    }

    /// Returns the currently running step, if any.
    #[must_use]
    pub fn running_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }

    /// Returns the number of successfully completed steps.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count()
    }

    /// Returns the failed step, if any.
    #[must_use]
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.status == StepStatus::Error)
    }

    /// Returns the next step eligible to start: the first pending step,
    /// provided no step has failed and nothing is running.
    #[must_use]
    pub fn next_step(&self) -> Option<StepKey> {
        if self.failed_step().is_some() || self.running_step().is_some() {
            return None;
        }
        self.steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.key)
    }

    /// Returns true if every step completed successfully.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Success)
    }

    /// Derived overall completion percent.
    ///
    /// `completed / total`, refined by the running step's own reported
    /// percent while one is running (a compile step may report incremental
    /// completion extracted from the external tool's output).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn overall_percent(&self) -> u8 {
        if self.steps.is_empty() {
            return 0;
        }
        let completed = self.completed_count() as u64;
        let total = self.steps.len() as u64;
        let running_part = u64::from(
            self.running_step()
                .and_then(|s| s.percent)
                .unwrap_or(0)
                .min(100),
        );
        (((completed * 100) + running_part) / total).min(100) as u8
    }

    /// Applies a step lifecycle event, validating the tracker invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the event violates the
    /// sequence order, starts a second concurrent step, targets a step
    /// that is not running, or follows an earlier failure.
    pub fn transition(&mut self, event: StepEvent) -> Result<()> {
        match event {
            StepEvent::Started { key } => self.apply_started(key),
            StepEvent::Progress { key, percent } => self.apply_progress(key, percent),
            StepEvent::Succeeded { key } => self.apply_terminal(key, StepStatus::Success, None),
            StepEvent::Failed { key, message } => {
                self.apply_terminal(key, StepStatus::Error, Some(message))
            }
        }
    }

    fn position(&self, key: StepKey) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.key == key)
            .ok_or_else(|| Error::InvalidStateTransition {
                from: "-".into(),
                to: "-".into(),
                reason: format!("step {key} is not part of this job"),
            })
    }

    fn apply_started(&mut self, key: StepKey) -> Result<()> {
        let index = self.position(key)?;

        if let Some(running) = self.running_step() {
            return Err(Error::InvalidStateTransition {
                from: StepStatus::Pending.to_string(),
                to: StepStatus::Running.to_string(),
                reason: format!("step {} is still running", running.key),
            });
        }
        if let Some(failed) = self.failed_step() {
            return Err(Error::InvalidStateTransition {
                from: StepStatus::Pending.to_string(),
                to: StepStatus::Running.to_string(),
                reason: format!("step {} already failed", failed.key),
            });
        }
        if self
            .steps
            .iter()
            .take(index)
            .any(|s| s.status != StepStatus::Success)
        {
            return Err(Error::InvalidStateTransition {
                from: self.steps[index].status.to_string(),
                to: StepStatus::Running.to_string(),
                reason: format!("step {key} started out of sequence"),
            });
        }

        let step = &mut self.steps[index];
        if !step.status.can_transition_to(StepStatus::Running) {
            return Err(Error::InvalidStateTransition {
                from: step.status.to_string(),
                to: StepStatus::Running.to_string(),
                reason: format!("step {key} cannot start again"),
            });
        }
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.percent = None;
        Ok(())
    }

    fn apply_progress(&mut self, key: StepKey, percent: u8) -> Result<()> {
        let index = self.position(key)?;
        let step = &mut self.steps[index];
        if step.status != StepStatus::Running {
            return Err(Error::InvalidStateTransition {
                from: step.status.to_string(),
                to: StepStatus::Running.to_string(),
                reason: format!("progress reported for step {key} which is not running"),
            });
        }
        step.percent = Some(percent.min(100));
        Ok(())
    }

    fn apply_terminal(
        &mut self,
        key: StepKey,
        target: StepStatus,
        message: Option<String>,
    ) -> Result<()> {
        let index = self.position(key)?;
        let step = &mut self.steps[index];
        if !step.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: step.status.to_string(),
                to: target.to_string(),
                reason: format!("step {key} is not running"),
            });
        }
        step.status = target;
        step.ended_at = Some(Utc::now());
        step.error = message;
        if target == StepStatus::Success {
            step.percent = Some(100);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_tracker() -> StepTracker {
        StepTracker::from_keys(vec![
            StepKey::CreateDatabase,
            StepKey::WriteEnvironment,
            StepKey::RunMigrations,
        ])
    }

    #[test]
    fn happy_path_runs_in_order() {
        let mut tracker = short_tracker();
        for key in [
            StepKey::CreateDatabase,
            StepKey::WriteEnvironment,
            StepKey::RunMigrations,
        ] {
            assert_eq!(tracker.next_step(), Some(key));
            tracker.transition(StepEvent::Started { key }).unwrap();
            assert_eq!(tracker.running_step().unwrap().key, key);
            tracker.transition(StepEvent::Succeeded { key }).unwrap();
        }
        assert!(tracker.all_succeeded());
        assert_eq!(tracker.overall_percent(), 100);
        assert_eq!(tracker.next_step(), None);
    }

    #[test]
    fn at_most_one_step_runs() {
        let mut tracker = short_tracker();
        tracker
            .transition(StepEvent::Started {
                key: StepKey::CreateDatabase,
            })
            .unwrap();
        let err = tracker
            .transition(StepEvent::Started {
                key: StepKey::WriteEnvironment,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn steps_cannot_start_out_of_sequence() {
        let mut tracker = short_tracker();
        let err = tracker
            .transition(StepEvent::Started {
                key: StepKey::RunMigrations,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn failure_freezes_later_steps() {
        let mut tracker = short_tracker();
        tracker
            .transition(StepEvent::Started {
                key: StepKey::CreateDatabase,
            })
            .unwrap();
        tracker
            .transition(StepEvent::Failed {
                key: StepKey::CreateDatabase,
                message: "database exists".into(),
            })
            .unwrap();

        assert_eq!(tracker.next_step(), None);
        let err = tracker
            .transition(StepEvent::Started {
                key: StepKey::WriteEnvironment,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(tracker
            .steps()
            .iter()
            .skip(1)
            .all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn overall_percent_blends_running_progress() {
        let mut tracker = short_tracker();
        assert_eq!(tracker.overall_percent(), 0);

        tracker
            .transition(StepEvent::Started {
                key: StepKey::CreateDatabase,
            })
            .unwrap();
        tracker
            .transition(StepEvent::Progress {
                key: StepKey::CreateDatabase,
                percent: 60,
            })
            .unwrap();
        assert_eq!(tracker.overall_percent(), 20);

        tracker
            .transition(StepEvent::Succeeded {
                key: StepKey::CreateDatabase,
            })
            .unwrap();
        assert_eq!(tracker.overall_percent(), 33);
    }

    #[test]
    fn progress_for_non_running_step_is_rejected() {
        let mut tracker = short_tracker();
        let err = tracker
            .transition(StepEvent::Progress {
                key: StepKey::CreateDatabase,
                percent: 50,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn terminal_events_require_a_running_step() {
        let mut tracker = short_tracker();
        let err = tracker
            .transition(StepEvent::Succeeded {
                key: StepKey::CreateDatabase,
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }
}
