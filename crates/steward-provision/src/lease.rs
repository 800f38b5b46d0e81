//! Server-owned lease sweep for abandoned jobs.
//!
//! Reservation release never depends on a client saying goodbye. Every
//! job carries a heartbeat that the orchestrator refreshes on each
//! observable transition; a job whose driving future was dropped (client
//! disconnect, process handoff) stops heartbeating, and once the lease
//! window elapses the sweeper cancels its reservation and marks it
//! failed.
//!
//! The sweep is race-free against a job that resumes settlement on its
//! own: commit and cancel settle at-most-once, so whichever side reaches
//! the ledger first wins and the other becomes a no-op.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::ProvisionConfig;
use crate::orchestrator::Orchestrator;

/// Periodically sweeps expired jobs on behalf of an [`Orchestrator`].
#[derive(Debug)]
pub struct LeaseSweeper {
    orchestrator: Arc<Orchestrator>,
    config: ProvisionConfig,
}

impl LeaseSweeper {
    /// Creates a sweeper for the given orchestrator.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, config: ProvisionConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Runs one sweep pass at the current time.
    ///
    /// Returns the number of jobs swept.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger store fails mid-sweep.
    pub async fn sweep_once(&self) -> crate::error::Result<usize> {
        let swept = self.orchestrator.sweep_expired(chrono::Utc::now()).await?;
        Ok(swept.len())
    }

    /// Spawns the periodic sweep loop.
    ///
    /// The loop runs until the returned handle is aborted or the runtime
    /// shuts down. Store errors are logged and the loop keeps going; a
    /// transient storage fault must not stop future sweeps.
    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh process
            // does not sweep before jobs have had a chance to heartbeat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.sweep_once().await {
                    Ok(0) => {}
                    Ok(count) => tracing::info!(count, "lease sweep reclaimed jobs"),
                    Err(error) => tracing::error!(%error, "lease sweep failed"),
                }
            }
        })
    }
}
