//! Best-effort progress broadcasting.
//!
//! [`ProgressBroadcaster`] is a publish/subscribe channel keyed by job
//! identifier. Delivery is at-most-once and non-persistent: a subscriber
//! that attaches late receives nothing retroactively and must separately
//! query current job state (see `Orchestrator::snapshot`) to reconcile.
//! A slow subscriber that falls behind the channel capacity loses the
//! oldest events.
//!
//! This is telemetry, never the system of record.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use steward_core::JobId;

use crate::events::ProgressEnvelope;

/// Default per-job channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Publish/subscribe channel for job progress, keyed by job identifier.
#[derive(Debug)]
pub struct ProgressBroadcaster {
    channels: Mutex<HashMap<JobId, broadcast::Sender<ProgressEnvelope>>>,
    capacity: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressBroadcaster {
    /// Creates a broadcaster whose per-job channels buffer up to
    /// `capacity` undelivered events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "broadcast capacity must be non-zero");
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, job_id: JobId) -> broadcast::Sender<ProgressEnvelope> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publishes an event to the job's channel.
    ///
    /// Best-effort: an event published while nobody is subscribed is
    /// silently dropped.
    pub fn publish(&self, envelope: ProgressEnvelope) {
        let sender = self.sender(envelope.job_id);
        let _ = sender.send(envelope);
    }

    /// Subscribes to a job's live event stream.
    ///
    /// No historical backlog is delivered.
    #[must_use]
    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<ProgressEnvelope> {
        self.sender(job_id).subscribe()
    }

    /// Drops the channel for a finished job.
    ///
    /// Existing receivers drain whatever they already buffered and then
    /// observe a closed stream.
    pub fn close(&self, job_id: JobId) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels.remove(&job_id);
    }

    /// Returns the number of jobs with an open channel.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProgressEvent;
    use crate::step::StepKey;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let broadcaster = ProgressBroadcaster::new(16);
        let job = JobId::generate();
        let mut rx = broadcaster.subscribe(job);

        broadcaster.publish(ProgressEnvelope::progress(
            job,
            "shop.example.com",
            StepKey::CreateDatabase,
            "Create database: running",
            None,
        ));
        broadcaster.publish(ProgressEnvelope::completed(job, "shop.example.com"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, ProgressEvent::Progress { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, ProgressEvent::Completed));
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_backlog() {
        let broadcaster = ProgressBroadcaster::new(16);
        let job = JobId::generate();

        broadcaster.publish(ProgressEnvelope::completed(job, "shop.example.com"));

        let mut rx = broadcaster.subscribe(job);
        broadcaster.publish(ProgressEnvelope::failed(job, "shop.example.com", "TIMEOUT"));

        let only = rx.recv().await.unwrap();
        assert!(matches!(only.event, ProgressEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn events_for_other_jobs_are_not_delivered() {
        let broadcaster = ProgressBroadcaster::new(16);
        let a = JobId::generate();
        let b = JobId::generate();
        let mut rx = broadcaster.subscribe(a);

        broadcaster.publish(ProgressEnvelope::completed(b, "b.example.com"));
        broadcaster.publish(ProgressEnvelope::completed(a, "a.example.com"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, a);
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_buffered_events() {
        let broadcaster = ProgressBroadcaster::new(16);
        let job = JobId::generate();
        let mut rx = broadcaster.subscribe(job);

        broadcaster.publish(ProgressEnvelope::completed(job, "shop.example.com"));
        broadcaster.close(job);
        assert_eq!(broadcaster.open_channels(), 0);

        assert!(rx.recv().await.is_ok());
        assert!(rx.recv().await.is_err());
    }
}
