//! Error types for the provisioning domain.
//!
//! The taxonomy separates pre-reservation rejections (validation, credit,
//! conflict) from post-reservation failures (step execution, timeout,
//! spawn). Anything in the second group triggers compensation of the held
//! reservation before the job is reported as terminally failed.

use std::time::Duration;

use steward_core::{JobId, PartnerId};

use crate::step::StepKey;

/// The result type used throughout steward-provision.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing response class for an error.
///
/// The dashboard and API layers map these onto their own status codes
/// ("payment required", "conflict", generic failure). Keeping the mapping
/// here avoids an HTTP dependency in the domain crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// Malformed request; reject before any side effect.
    BadRequest,
    /// Reservation denied for lack of credits.
    PaymentRequired,
    /// Another job is already active for the same domain.
    Conflict,
    /// Any other failure.
    Failure,
}

/// Suggested remediation category for a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Top up the partner's credit balance.
    AddCredits,
    /// Wait for or cancel the conflicting job.
    RetryLater,
    /// Raise memory/time limits (timeout and OOM-class failures).
    RaiseResourceLimits,
    /// Operator intervention required (the operation could not start).
    ContactOperator,
    /// Inspect the captured diagnostics and fix the input.
    InspectDiagnostics,
}

/// Errors that can occur in provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A malformed request was rejected before reservation.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of what made the request invalid.
        message: String,
    },

    /// The reservation was denied for lack of credits. No side effects
    /// occurred; no compensation is needed.
    #[error("insufficient credits: {needed} needed, {balance} available")]
    InsufficientCredits {
        /// Credits required for the installation.
        needed: i64,
        /// Credits currently available.
        balance: i64,
    },

    /// Another job is already active for the same domain. Rejected before
    /// reservation.
    #[error("installation already in progress for domain {domain}")]
    Conflict {
        /// The contested domain.
        domain: String,
        /// The job currently holding the domain.
        active_job: JobId,
    },

    /// A provisioning step's external operation failed.
    #[error("step {step} failed: {message}")]
    StepExecution {
        /// The step that failed.
        step: StepKey,
        /// Error message from the external operation.
        message: String,
        /// Bounded tail of captured stdout, if any.
        stdout_tail: Option<String>,
        /// Bounded tail of captured stderr, if any.
        stderr_tail: Option<String>,
    },

    /// A step exceeded its wall-clock limit. Distinct from
    /// [`Error::StepExecution`] so callers can suggest raising limits.
    #[error("step {step} timed out after {limit:?}")]
    Timeout {
        /// The step that timed out.
        step: StepKey,
        /// The configured limit that was exceeded.
        limit: Duration,
    },

    /// The external operation could not even start. Fatal, non-retryable
    /// without operator intervention.
    #[error("step {step} could not start: {message}")]
    Spawn {
        /// The step whose operation failed to spawn.
        step: StepKey,
        /// Description of the spawn failure.
        message: String,
    },

    /// The job was cancelled before completion.
    #[error("job cancelled: {reason}")]
    Cancelled {
        /// Why the job was cancelled (client request, lease expiry).
        reason: String,
    },

    /// The referenced partner does not exist.
    #[error("partner not found: {partner_id}")]
    PartnerNotFound {
        /// The partner ID that was looked up.
        partner_id: PartnerId,
    },

    /// The referenced job does not exist.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// The job ID that was looked up.
        job_id: JobId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from steward-core.
    #[error("core error: {0}")]
    Core(#[from] steward_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Returns the machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::Conflict { .. } => "CONFLICT",
            Self::StepExecution { .. } => "STEP_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Cancelled { .. } => "CANCELLED",
            Self::PartnerNotFound { .. } => "PARTNER_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::InvalidStateTransition { .. } => "INVALID_TRANSITION",
            Self::Storage { .. } => "STORAGE",
            Self::Serialization { .. } => "SERIALIZATION",
            Self::Core(_) => "INTERNAL",
        }
    }

    /// Returns the caller-facing response class for this error.
    #[must_use]
    pub const fn response_class(&self) -> ResponseClass {
        match self {
            Self::Validation { .. } => ResponseClass::BadRequest,
            Self::InsufficientCredits { .. } => ResponseClass::PaymentRequired,
            Self::Conflict { .. } => ResponseClass::Conflict,
            _ => ResponseClass::Failure,
        }
    }

    /// Returns the suggested remediation category, if one applies.
    #[must_use]
    pub const fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::InsufficientCredits { .. } => Some(Remediation::AddCredits),
            Self::Conflict { .. } => Some(Remediation::RetryLater),
            Self::Timeout { .. } => Some(Remediation::RaiseResourceLimits),
            Self::Spawn { .. } => Some(Remediation::ContactOperator),
            Self::StepExecution { .. } => Some(Remediation::InspectDiagnostics),
            _ => None,
        }
    }

    /// Returns true if this error occurred after a reservation was granted
    /// and therefore requires compensation.
    #[must_use]
    pub const fn requires_compensation(&self) -> bool {
        matches!(
            self,
            Self::StepExecution { .. }
                | Self::Timeout { .. }
                | Self::Spawn { .. }
                | Self::Cancelled { .. }
        )
    }
}
