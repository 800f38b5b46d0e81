//! Provisioning step definitions and per-step execution state.
//!
//! A job executes a fixed, totally ordered sequence of steps. The sequence
//! depends on the job's source kind: package-based installs unpack an
//! uploaded archive, version-control-based installs clone a repository.
//! Everything after the first step is identical.
//!
//! Later steps assume artifacts produced by earlier ones (environment
//! configuration requires the database to exist, compilation requires
//! dependencies to be installed), so no step may start before its
//! predecessor reports success.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a job's application sources come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    /// An uploaded application package.
    Package,
    /// A version-control repository.
    VersionControl,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Package => write!(f, "PACKAGE"),
            Self::VersionControl => write!(f, "VERSION_CONTROL"),
        }
    }
}

/// Well-known provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKey {
    /// Unpack the uploaded application package (package-based jobs only).
    UnpackPackage,
    /// Clone the application repository (version-control-based jobs only).
    CloneRepository,
    /// Create the customer database.
    CreateDatabase,
    /// Write environment configuration files.
    WriteEnvironment,
    /// Install application dependencies.
    InstallDependencies,
    /// Run schema migrations.
    RunMigrations,
    /// Compile the application.
    CompileApplication,
    /// Register the application with the process manager.
    ConfigureProcessManager,
    /// Wire the domain into the reverse proxy.
    ConfigureProxy,
    /// Verify the deployed environment responds.
    VerifyDeployment,
}

impl StepKey {
    /// Returns the human-readable label for this step.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::UnpackPackage => "Unpack application package",
            Self::CloneRepository => "Clone application repository",
            Self::CreateDatabase => "Create database",
            Self::WriteEnvironment => "Write environment configuration",
            Self::InstallDependencies => "Install dependencies",
            Self::RunMigrations => "Run migrations",
            Self::CompileApplication => "Compile application",
            Self::ConfigureProcessManager => "Configure process manager",
            Self::ConfigureProxy => "Configure reverse proxy",
            Self::VerifyDeployment => "Verify deployment",
        }
    }

    /// Returns a snake_case key suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnpackPackage => "unpack_package",
            Self::CloneRepository => "clone_repository",
            Self::CreateDatabase => "create_database",
            Self::WriteEnvironment => "write_environment",
            Self::InstallDependencies => "install_dependencies",
            Self::RunMigrations => "run_migrations",
            Self::CompileApplication => "compile_application",
            Self::ConfigureProcessManager => "configure_process_manager",
            Self::ConfigureProxy => "configure_proxy",
            Self::VerifyDeployment => "verify_deployment",
        }
    }

    /// Returns true for steps whose external operation can run unbounded
    /// and therefore gets the long (compile-class) timeout.
    #[must_use]
    pub const fn is_compile_class(&self) -> bool {
        matches!(self, Self::CompileApplication | Self::InstallDependencies)
    }
}

impl std::fmt::Display for StepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns the fixed step sequence for the given source kind.
///
/// The order is total and identical for every job of the same kind.
#[must_use]
pub fn step_sequence(kind: SourceKind) -> Vec<StepKey> {
    let first = match kind {
        SourceKind::Package => StepKey::UnpackPackage,
        SourceKind::VersionControl => StepKey::CloneRepository,
    };
    vec![
        first,
        StepKey::CreateDatabase,
        StepKey::WriteEnvironment,
        StepKey::InstallDependencies,
        StepKey::RunMigrations,
        StepKey::CompileApplication,
        StepKey::ConfigureProcessManager,
        StepKey::ConfigureProxy,
        StepKey::VerifyDeployment,
    ]
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not started.
    Pending,
    /// Currently executing. At most one step per job is in this state.
    Running,
    /// Completed successfully.
    Success,
    /// Failed; later steps in the job never leave `Pending`.
    Error,
}

impl StepStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running),
            Self::Running => matches!(target, Self::Success | Self::Error),
            Self::Success | Self::Error => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution state for a single step within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Which step this is.
    pub key: StepKey,
    /// Human-readable label.
    pub label: String,
    /// Current status.
    pub status: StepStatus,
    /// Step-reported progress percent (0-100) while running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Error message, if the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    /// Creates a new pending record for the given step.
    #[must_use]
    pub fn new(key: StepKey) -> Self {
        Self {
            key,
            label: key.label().to_string(),
            status: StepStatus::Pending,
            percent: None,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Returns the wall-clock duration, if the step has both timestamps.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sequences_have_the_same_length() {
        assert_eq!(
            step_sequence(SourceKind::Package).len(),
            step_sequence(SourceKind::VersionControl).len()
        );
    }

    #[test]
    fn package_jobs_unpack_first() {
        let steps = step_sequence(SourceKind::Package);
        assert_eq!(steps[0], StepKey::UnpackPackage);
        assert!(!steps.contains(&StepKey::CloneRepository));
    }

    #[test]
    fn version_control_jobs_clone_first() {
        let steps = step_sequence(SourceKind::VersionControl);
        assert_eq!(steps[0], StepKey::CloneRepository);
        assert!(!steps.contains(&StepKey::UnpackPackage));
    }

    #[test]
    fn status_transitions_are_restricted() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Success));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Error));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Success));
        assert!(!StepStatus::Success.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Error.can_transition_to(StepStatus::Running));
    }

    #[test]
    fn compile_class_steps_are_flagged() {
        assert!(StepKey::CompileApplication.is_compile_class());
        assert!(StepKey::InstallDependencies.is_compile_class());
        assert!(!StepKey::CreateDatabase.is_compile_class());
    }

    #[test]
    fn record_duration_requires_both_timestamps() {
        let mut record = StepRecord::new(StepKey::CreateDatabase);
        assert!(record.duration().is_none());
        record.started_at = Some(Utc::now());
        assert!(record.duration().is_none());
        record.ended_at = Some(Utc::now());
        assert!(record.duration().is_some());
    }
}
