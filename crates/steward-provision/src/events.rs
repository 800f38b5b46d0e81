//! Progress events streamed to observers of a job.
//!
//! Events are wrapped in a small envelope carrying a ULID identifier and
//! the job scope. ULIDs sort chronologically when compared as strings, so
//! an observer collecting events from several jobs can interleave them
//! without a separate sequence field.
//!
//! Delivery is at-most-once and non-persistent; the ledger store and the
//! step tracker are the systems of record, never this channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use steward_core::JobId;

use crate::step::StepKey;

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One observable moment in a job's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A step transition or incremental progress report.
    Progress {
        /// The step this concerns.
        step: StepKey,
        /// Human-readable message.
        message: String,
        /// Reported completion percent (0-100), if the step streams one.
        #[serde(skip_serializing_if = "Option::is_none")]
        percent: Option<u8>,
    },
    /// A free-form output line from a step's external operation.
    LogLine {
        /// The step or tool that produced the line.
        source: String,
        /// Which stream it came from.
        stream: OutputStream,
        /// The line content.
        content: String,
    },
    /// The job completed successfully.
    Completed,
    /// The job failed terminally.
    Failed {
        /// Machine-readable failure reason.
        reason: String,
    },
}

/// Envelope wrapping a [`ProgressEvent`] with its job scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEnvelope {
    /// Unique event identifier (ULID).
    pub id: String,
    /// The job this event belongs to.
    pub job_id: JobId,
    /// The job's target domain.
    pub domain: String,
    /// Event timestamp.
    pub time: DateTime<Utc>,
    /// The event payload.
    pub event: ProgressEvent,
}

impl ProgressEnvelope {
    /// Wraps an event for the given job.
    #[must_use]
    pub fn new(job_id: JobId, domain: impl Into<String>, event: ProgressEvent) -> Self {
        Self {
            id: Ulid::new().to_string(),
            job_id,
            domain: domain.into(),
            time: Utc::now(),
            event,
        }
    }

    /// Builds a step progress event.
    #[must_use]
    pub fn progress(
        job_id: JobId,
        domain: impl Into<String>,
        step: StepKey,
        message: impl Into<String>,
        percent: Option<u8>,
    ) -> Self {
        Self::new(
            job_id,
            domain,
            ProgressEvent::Progress {
                step,
                message: message.into(),
                percent,
            },
        )
    }

    /// Builds a log line event.
    #[must_use]
    pub fn log_line(
        job_id: JobId,
        domain: impl Into<String>,
        source: impl Into<String>,
        stream: OutputStream,
        content: impl Into<String>,
    ) -> Self {
        Self::new(
            job_id,
            domain,
            ProgressEvent::LogLine {
                source: source.into(),
                stream,
                content: content.into(),
            },
        )
    }

    /// Builds a terminal success event.
    #[must_use]
    pub fn completed(job_id: JobId, domain: impl Into<String>) -> Self {
        Self::new(job_id, domain, ProgressEvent::Completed)
    }

    /// Builds a terminal failure event.
    #[must_use]
    pub fn failed(job_id: JobId, domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            job_id,
            domain,
            ProgressEvent::Failed {
                reason: reason.into(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_with_kind_tag() {
        let envelope = ProgressEnvelope::progress(
            JobId::generate(),
            "shop.example.com",
            StepKey::CreateDatabase,
            "Create database: running",
            Some(10),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"kind\":\"progress\""));
        assert!(json.contains("create_database"));
    }

    #[test]
    fn envelope_ids_sort_chronologically() {
        let job = JobId::generate();
        let a = ProgressEnvelope::completed(job, "a.example.com");
        let b = ProgressEnvelope::completed(job, "a.example.com");
        assert!(a.id <= b.id);
    }

    #[test]
    fn failed_event_carries_reason() {
        let envelope = ProgressEnvelope::failed(JobId::generate(), "x.example.com", "TIMEOUT");
        match envelope.event {
            ProgressEvent::Failed { reason } => assert_eq!(reason, "TIMEOUT"),
            _ => panic!("expected failed event"),
        }
    }
}
