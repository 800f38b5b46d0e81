//! Provisioning orchestrator: drives one installation job end to end.
//!
//! The orchestrator is the saga driver. For each job it:
//!
//! 1. Rejects the request if another job is already active for the same
//!    domain (mutual exclusion on domain, checked before reservation).
//! 2. Acquires a credit reservation. An insufficient balance terminates
//!    the job immediately with no steps run, so unpayable partial
//!    environments are never created.
//! 3. Executes the fixed step sequence strictly in order, each step under
//!    a hard wall-clock timeout, updating the step tracker and publishing
//!    a progress event after every transition.
//! 4. On the first failure, timeout, or cancellation: stops the sequence,
//!    cancels the reservation (compensation), and marks the job failed.
//! 5. If every step succeeds: commits the reservation (the charge becomes
//!    permanent) and marks the job completed.
//!
//! A failed job is never retried automatically. Intermediate steps may
//! have left partial side effects; only the credit charge is guaranteed
//! to be reversed. Retrying means submitting a new job.
//!
//! Jobs also heartbeat on every transition. If the future driving a job
//! is dropped (a disconnecting client tearing down its request), the
//! heartbeat stops and the lease sweeper compensates the reservation;
//! nothing depends on the client sending a farewell message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use steward_core::{JobId, PartnerId};

use crate::broadcast::ProgressBroadcaster;
use crate::config::ProvisionConfig;
use crate::error::{Error, Result};
use crate::events::{OutputStream, ProgressEnvelope};
use crate::job::{FailureReport, Job, JobState};
use crate::reservation::{ReservationManager, ReserveOutcome};
use crate::runner::{StepContext, StepOutcome, StepProgress, StepRunner};
use crate::step::{SourceKind, StepKey};
use crate::tracker::StepEvent;

/// A request to provision an environment.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// The partner paying for the installation.
    pub partner_id: PartnerId,
    /// The domain to provision.
    pub domain: String,
    /// Where the application sources come from.
    pub source: SourceKind,
    /// The member who requested the installation.
    pub actor: String,
    /// Step-specific configuration passed through to the runner.
    pub config: Value,
}

impl InstallRequest {
    /// Creates a request with the given partner, domain, and source kind.
    #[must_use]
    pub fn new(partner_id: PartnerId, domain: impl Into<String>, source: SourceKind) -> Self {
        Self {
            partner_id,
            domain: domain.into(),
            source,
            actor: "system".to_string(),
            config: Value::Null,
        }
    }

    /// Sets the requesting actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Sets step-specific configuration.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Terminal outcome of a driven job.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// The job that ran.
    pub job_id: JobId,
    /// The provisioned domain.
    pub domain: String,
    /// Terminal state (`Completed` or `Failed`).
    pub state: JobState,
    /// Failure payload, if the job failed.
    pub failure: Option<FailureReport>,
}

impl InstallReport {
    /// Returns true if the installation completed.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.state, JobState::Completed)
    }
}

/// Per-job bookkeeping held by the orchestrator registry.
struct JobSlot {
    job: Arc<StdRwLock<Job>>,
    cancel_tx: watch::Sender<Option<String>>,
    cancel_rx: watch::Receiver<Option<String>>,
}

/// Drives installation jobs against the reservation manager and a step
/// runner.
///
/// One orchestrator instance serves the whole process. Independent jobs
/// for different domains run concurrently; each job is one sequential
/// thread of control.
pub struct Orchestrator {
    reservations: Arc<ReservationManager>,
    runner: Arc<dyn StepRunner>,
    broadcaster: Arc<ProgressBroadcaster>,
    config: ProvisionConfig,
    jobs: StdRwLock<HashMap<JobId, Arc<JobSlot>>>,
    active_domains: StdMutex<HashMap<String, JobId>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        reservations: Arc<ReservationManager>,
        runner: Arc<dyn StepRunner>,
        broadcaster: Arc<ProgressBroadcaster>,
        config: ProvisionConfig,
    ) -> Self {
        Self {
            reservations,
            runner,
            broadcaster,
            config,
            jobs: StdRwLock::new(HashMap::new()),
            active_domains: StdMutex::new(HashMap::new()),
        }
    }

    /// Returns the broadcaster observers subscribe through.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Returns the job currently holding a domain, if any.
    #[must_use]
    pub fn job_for_domain(&self, domain: &str) -> Option<JobId> {
        self.active_domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .copied()
    }

    /// Returns a point-in-time snapshot of a job.
    #[must_use]
    pub fn snapshot(&self, job_id: JobId) -> Option<Job> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        jobs.get(&job_id).map(|slot| {
            slot.job
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Requests cancellation of a running job.
    ///
    /// The job stops at the next suspension point (step boundary or
    /// mid-step await) and goes through the standard compensation path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] if the job is unknown.
    pub fn cancel(&self, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        let slot = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.get(&job_id).cloned()
        };
        let Some(slot) = slot else {
            return Err(Error::JobNotFound { job_id });
        };
        let _ = slot.cancel_tx.send(Some(reason.into()));
        Ok(())
    }

    /// Records external progress for a job, extending its lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] if the job is unknown.
    pub fn heartbeat(&self, job_id: JobId) -> Result<()> {
        let slot = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.get(&job_id).cloned()
        };
        let Some(slot) = slot else {
            return Err(Error::JobNotFound { job_id });
        };
        slot.job
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_heartbeat();
        Ok(())
    }

    /// Drives one installation job to a terminal state.
    ///
    /// Returns `Ok` with a terminal report for jobs that were admitted,
    /// including those that failed during provisioning (the report
    /// carries the failure payload). Pre-admission rejections surface as
    /// errors: [`Error::Validation`], [`Error::Conflict`], and
    /// [`Error::PartnerNotFound`].
    ///
    /// # Errors
    ///
    /// Returns an error for rejected requests or storage failures.
    #[tracing::instrument(skip(self, request), fields(domain = %request.domain, partner_id = %request.partner_id, job_id = tracing::field::Empty))]
    pub async fn run(&self, request: InstallRequest) -> Result<InstallReport> {
        Self::validate(&request)?;

        let slot = self.admit(&request)?;
        let job_id = {
            let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
            job.id
        };
        tracing::Span::current().record("job_id", tracing::field::display(job_id));

        match self.drive(&slot, &request).await {
            Ok(report) => {
                self.release_domain(&request.domain);
                self.broadcaster.close(report.job_id);
                Ok(report)
            }
            Err(error) => {
                // Post-admission invariant failures (storage, unknown
                // partner). Compensate and tear down before propagating.
                let report = self.fail_job(&slot, &error).await;
                self.release_domain(&request.domain);
                self.broadcaster.close(report.job_id);
                Err(error)
            }
        }
    }

    /// Compensates every non-terminal job whose lease expired at `now`,
    /// and evicts terminal jobs older than the retention window.
    ///
    /// Called periodically by the lease sweeper. Returns the jobs whose
    /// reservations were swept (evictions are not reported; the snapshot
    /// simply stops resolving once the retention window passes).
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger store fails mid-sweep.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let lease = chrono::Duration::from_std(self.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let candidates: Vec<Arc<JobSlot>> = {
            let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
            jobs.values()
                .filter(|slot| {
                    slot.job
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .is_lease_expired_at(now, lease)
                })
                .cloned()
                .collect()
        };

        let mut swept = Vec::new();
        for slot in candidates {
            let error = Error::Cancelled {
                reason: "lease expired without progress".into(),
            };
            let report = self.fail_job(&slot, &error).await;
            let domain = {
                let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
                job.domain.clone()
            };
            self.release_domain(&domain);
            self.broadcaster.close(report.job_id);
            tracing::warn!(job_id = %report.job_id, %domain, "swept expired job");
            swept.push(report.job_id);
        }

        self.evict_terminal(now);
        Ok(swept)
    }

    /// Drops registry entries for jobs that have been terminal longer
    /// than the retention window, so the registry does not grow with
    /// every installation ever run.
    fn evict_terminal(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.config.terminal_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        jobs.retain(|job_id, slot| {
            let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
            let expired = job.state.is_terminal()
                && job
                    .completed_at
                    .is_some_and(|done| now.signed_duration_since(done) > retention);
            if expired {
                tracing::debug!(%job_id, "evicted terminal job");
            }
            !expired
        });
    }

    fn validate(request: &InstallRequest) -> Result<()> {
        let domain = request.domain.trim();
        if domain.is_empty() {
            return Err(Error::validation("domain must not be empty"));
        }
        if domain.contains(char::is_whitespace) || domain.contains('/') {
            return Err(Error::validation("domain contains illegal characters"));
        }
        if request.actor.trim().is_empty() {
            return Err(Error::validation("actor must not be empty"));
        }
        Ok(())
    }

    /// Registers the job, enforcing mutual exclusion on domain.
    ///
    /// The domain is claimed before any reservation is attempted, so a
    /// concurrent duplicate request is rejected with a conflict without
    /// touching the ledger.
    fn admit(&self, request: &InstallRequest) -> Result<Arc<JobSlot>> {
        let job = Job::new(request.domain.clone(), request.partner_id, request.source);
        let job_id = job.id;

        {
            let mut active = self
                .active_domains
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(active_job) = active.get(&request.domain) {
                return Err(Error::Conflict {
                    domain: request.domain.clone(),
                    active_job: *active_job,
                });
            }
            active.insert(request.domain.clone(), job_id);
        }

        let (cancel_tx, cancel_rx) = watch::channel(None);
        let slot = Arc::new(JobSlot {
            job: Arc::new(StdRwLock::new(job)),
            cancel_tx,
            cancel_rx,
        });
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id, Arc::clone(&slot));
        Ok(slot)
    }

    fn release_domain(&self, domain: &str) {
        let mut active = self
            .active_domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        active.remove(domain);
    }

    /// The saga body: reserve, run steps, settle.
    async fn drive(&self, slot: &JobSlot, request: &InstallRequest) -> Result<InstallReport> {
        let (job_id, domain) = {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            job.transition(JobState::Reserving)?;
            (job.id, job.domain.clone())
        };

        let outcome = self
            .reservations
            .reserve(request.partner_id, &domain, &request.actor)
            .await?;

        let ledger_id = match outcome {
            ReserveOutcome::Granted { ledger_id, .. } => ledger_id,
            ReserveOutcome::Insufficient { needed, balance } => {
                // Fail fast: no reservation was made and no steps run.
                let error = Error::InsufficientCredits { needed, balance };
                return Ok(self.fail_job_inner(slot, &error, false).await);
            }
        };

        {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            job.reservation_ledger_id = Some(ledger_id);
            job.transition(JobState::Running)?;
        }

        let mut context = StepContext::new(domain.clone(), request.source);
        context.config = request.config.clone();

        loop {
            let next = {
                let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
                job.tracker.next_step()
            };
            let Some(step) = next else {
                break;
            };

            let cancel_requested = slot.cancel_rx.borrow().clone();
            if let Some(reason) = cancel_requested {
                let error = Error::Cancelled { reason };
                return Ok(self.fail_job_inner(slot, &error, true).await);
            }

            if let Err(error) = self.run_step(slot, &mut context, job_id, &domain, step).await {
                self.record_step_failure(slot, job_id, &domain, step, &error);
                return Ok(self.fail_job_inner(slot, &error, true).await);
            }
        }

        {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            job.transition(JobState::Finalizing)?;
        }

        let committed = self
            .reservations
            .commit(request.partner_id, ledger_id, &job_id.to_string())
            .await?;
        if !committed {
            // The sweeper (or an explicit cancel) settled first.
            let error = Error::Cancelled {
                reason: "reservation was cancelled before commit".into(),
            };
            return Ok(self.fail_job_inner(slot, &error, false).await);
        }

        let report = {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            job.reservation_settled = true;
            job.transition(JobState::Completed)?;
            InstallReport {
                job_id: job.id,
                domain: job.domain.clone(),
                state: job.state,
                failure: None,
            }
        };
        self.broadcaster
            .publish(ProgressEnvelope::completed(job_id, &domain));
        tracing::info!(%job_id, %domain, "installation completed");
        Ok(report)
    }

    /// Runs one step under its timeout and the job's cancel signal.
    async fn run_step(
        &self,
        slot: &JobSlot,
        context: &mut StepContext,
        job_id: JobId,
        domain: &str,
        step: StepKey,
    ) -> Result<()> {
        {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            job.tracker.transition(StepEvent::Started { key: step })?;
            job.record_heartbeat();
        }
        self.broadcaster.publish(ProgressEnvelope::progress(
            job_id,
            domain,
            step,
            format!("{}: running", step.label()),
            None,
        ));
        tracing::debug!(%job_id, %step, "step started");

        let progress_job = Arc::clone(&slot.job);
        let progress_broadcaster = Arc::clone(&self.broadcaster);
        let progress_domain = domain.to_string();
        let on_progress = move |progress: StepProgress| {
            if let Some(percent) = progress.percent {
                {
                    let mut job = progress_job.write().unwrap_or_else(PoisonError::into_inner);
                    let _ = job
                        .tracker
                        .transition(StepEvent::Progress { key: step, percent });
                    job.record_heartbeat();
                }
                progress_broadcaster.publish(ProgressEnvelope::progress(
                    job_id,
                    &progress_domain,
                    step,
                    progress.message.unwrap_or_default(),
                    Some(percent),
                ));
            } else if let Some(message) = progress.message {
                progress_broadcaster.publish(ProgressEnvelope::log_line(
                    job_id,
                    &progress_domain,
                    step.as_str(),
                    progress.stream.unwrap_or(OutputStream::Stdout),
                    message,
                ));
            }
        };

        let limit = self.config.timeout_for(step);
        let mut cancel_rx = slot.cancel_rx.clone();
        // The polled runner future IS the job's liveness: while it is
        // being driven here, keep the heartbeat fresh so a slow but
        // healthy step (a long compile) is never mistaken for an
        // abandoned job. The ticker lives inside this future, so
        // dropping the driver stops the keepalive with it and the lease
        // sweep takes over.
        let keepalive_period = (self.config.lease_ttl / 4).max(Duration::from_millis(10));
        let deadline = tokio::time::Instant::now() + limit;
        let outcome = {
            let run = self.runner.run(step, context, &on_progress);
            tokio::pin!(run);
            let mut keepalive = tokio::time::interval(keepalive_period);
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        let reason = cancel_rx
                            .borrow()
                            .clone()
                            .unwrap_or_else(|| "cancelled".to_string());
                        return Err(Error::Cancelled { reason });
                    }
                    _ = keepalive.tick() => {
                        slot.job
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .record_heartbeat();
                    }
                    () = tokio::time::sleep_until(deadline) => {
                        return Err(Error::Timeout { step, limit });
                    }
                    outcome = &mut run => break outcome,
                }
            }
        };

        match outcome {
            StepOutcome::Succeeded(artifact) => {
                if let Some(artifact) = artifact {
                    context.artifacts.insert(step, artifact);
                }
                {
                    let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
                    job.tracker.transition(StepEvent::Succeeded { key: step })?;
                    job.record_heartbeat();
                }
                self.broadcaster.publish(ProgressEnvelope::progress(
                    job_id,
                    domain,
                    step,
                    format!("{}: success", step.label()),
                    Some(100),
                ));
                tracing::debug!(%job_id, %step, "step succeeded");
                Ok(())
            }
            StepOutcome::Failed(failure) => Err(Error::StepExecution {
                step,
                message: failure.message,
                stdout_tail: failure.stdout_tail,
                stderr_tail: failure.stderr_tail,
            }),
            StepOutcome::SpawnFailed(message) => Err(Error::Spawn { step, message }),
        }
    }

    /// Marks the failing step as errored on the tracker and publishes the
    /// transition. Transition errors are ignored here: by the time a
    /// timeout or cancel fires, the step may already be terminal.
    fn record_step_failure(
        &self,
        slot: &JobSlot,
        job_id: JobId,
        domain: &str,
        step: StepKey,
        error: &Error,
    ) {
        {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            let _ = job.tracker.transition(StepEvent::Failed {
                key: step,
                message: error.to_string(),
            });
        }
        self.broadcaster.publish(ProgressEnvelope::progress(
            job_id,
            domain,
            step,
            format!("{}: error: {error}", step.label()),
            None,
        ));
        tracing::warn!(%job_id, %step, %error, "step failed");
    }

    /// Terminal failure path used by `run` for post-admission errors.
    async fn fail_job(&self, slot: &JobSlot, error: &Error) -> InstallReport {
        self.fail_job_inner(slot, error, error.requires_compensation())
            .await
    }

    /// Moves the job to `Failed`, compensating the reservation if one is
    /// still held, and publishes the terminal event.
    async fn fail_job_inner(
        &self,
        slot: &JobSlot,
        error: &Error,
        compensate: bool,
    ) -> InstallReport {
        let (job_id, domain, partner_id, reservation) = {
            let job = slot.job.read().unwrap_or_else(PoisonError::into_inner);
            (
                job.id,
                job.domain.clone(),
                job.partner_id,
                job.holds_unsettled_reservation()
                    .then_some(job.reservation_ledger_id)
                    .flatten(),
            )
        };

        if compensate {
            if let Some(ledger_id) = reservation {
                match self
                    .reservations
                    .cancel(partner_id, ledger_id, Some(error.code()))
                    .await
                {
                    Ok(cancelled) => {
                        tracing::info!(%job_id, cancelled, "reservation compensated");
                    }
                    Err(cancel_error) => {
                        tracing::error!(%job_id, %cancel_error, "compensation failed");
                    }
                }
            }
        }

        let report = {
            let mut job = slot.job.write().unwrap_or_else(PoisonError::into_inner);
            if reservation.is_some() {
                job.reservation_settled = true;
            }
            if !job.state.is_terminal() {
                // All non-terminal states may move to Failed.
                let _ = job.transition(JobState::Failed);
            }
            job.failure = Some(FailureReport::from_error(error));
            InstallReport {
                job_id: job.id,
                domain: job.domain.clone(),
                state: job.state,
                failure: job.failure.clone(),
            }
        };

        self.broadcaster
            .publish(ProgressEnvelope::failed(job_id, &domain, error.code()));
        tracing::warn!(%job_id, %domain, code = error.code(), "installation failed");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerReason, Partner};
    use crate::runner::{ScriptedRunner, StepFailure};
    use crate::step::StepStatus;
    use crate::store::memory::InMemoryLedgerStore;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryLedgerStore>,
        orchestrator: Arc<Orchestrator>,
        partner_id: PartnerId,
    }

    fn harness(balance: i64, price: i64, runner: ScriptedRunner) -> Harness {
        harness_with_config(balance, price, runner, ProvisionConfig::default())
    }

    fn harness_with_config(
        balance: i64,
        price: i64,
        runner: ScriptedRunner,
        config: ProvisionConfig,
    ) -> Harness {
        let store = Arc::new(InMemoryLedgerStore::new());
        let partner = Partner::new(PartnerId::generate(), "Acme Hosting", balance, price);
        let partner_id = partner.id;
        store.insert(partner);

        let reservations = Arc::new(ReservationManager::new(
            Arc::clone(&store) as Arc<dyn crate::store::LedgerStore>
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            reservations,
            Arc::new(runner),
            Arc::new(ProgressBroadcaster::new(64)),
            config,
        ));
        Harness {
            store,
            orchestrator,
            partner_id,
        }
    }

    async fn balance_of(h: &Harness) -> i64 {
        use crate::store::LedgerStore;
        h.store
            .load(h.partner_id)
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    #[tokio::test]
    async fn successful_install_commits_the_charge() {
        let h = harness(1, 1, ScriptedRunner::all_succeed());
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let report = h.orchestrator.run(request).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(balance_of(&h).await, 0);

        let job = h.orchestrator.snapshot(report.job_id).unwrap();
        assert!(job.tracker.all_succeeded());
        assert!(job.reservation_settled);

        use crate::store::LedgerStore;
        let partner = h.store.load(h.partner_id).await.unwrap().unwrap();
        let entry = partner.entry(job.reservation_ledger_id.unwrap()).unwrap();
        assert_eq!(entry.reason, LedgerReason::Consume);
        assert_eq!(entry.reference.as_deref(), Some(&*report.job_id.to_string()));
    }

    #[tokio::test]
    async fn insufficient_credits_fails_before_any_step() {
        let h = harness(0, 1, ScriptedRunner::all_succeed());
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let report = h.orchestrator.run(request).await.unwrap();
        assert!(!report.succeeded());
        let failure = report.failure.unwrap();
        assert_eq!(failure.code, "INSUFFICIENT_CREDITS");

        let job = h.orchestrator.snapshot(report.job_id).unwrap();
        assert!(job
            .tracker
            .steps()
            .iter()
            .all(|s| s.status == StepStatus::Pending));
        assert_eq!(balance_of(&h).await, 0);
    }

    #[tokio::test]
    async fn step_failure_compensates_the_reservation() {
        let runner = ScriptedRunner::all_succeed().fail_at(
            StepKey::WriteEnvironment,
            StepFailure::new("disk full").with_tails(None, Some("ENOSPC".into())),
        );
        let h = harness(5, 1, runner);
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let report = h.orchestrator.run(request).await.unwrap();
        assert_eq!(report.state, JobState::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.code, "STEP_FAILED");
        assert_eq!(failure.step, Some(StepKey::WriteEnvironment));
        assert_eq!(failure.stderr_tail.as_deref(), Some("ENOSPC"));

        // Balance restored; entry settled as cancelled.
        assert_eq!(balance_of(&h).await, 5);
        let job = h.orchestrator.snapshot(report.job_id).unwrap();
        use crate::store::LedgerStore;
        let partner = h.store.load(h.partner_id).await.unwrap().unwrap();
        let entry = partner.entry(job.reservation_ledger_id.unwrap()).unwrap();
        assert_eq!(entry.reason, LedgerReason::ReserveCancel);

        // Steps after the failure never started.
        let steps = job.tracker.steps();
        let failed_index = steps
            .iter()
            .position(|s| s.status == StepStatus::Error)
            .unwrap();
        assert!(steps[failed_index + 1..]
            .iter()
            .all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn conflicting_domain_is_rejected_before_reservation() {
        let runner = ScriptedRunner::all_succeed()
            .delay_at(StepKey::UnpackPackage, Duration::from_millis(300));
        let h = harness(10, 1, runner);

        let first = {
            let orchestrator = Arc::clone(&h.orchestrator);
            let request =
                InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);
            tokio::spawn(async move { orchestrator.run(request).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);
        let err = h.orchestrator.run(request).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        // The first job is unaffected; only its own charge applies.
        let report = first.await.unwrap().unwrap();
        assert!(report.succeeded());
        assert_eq!(balance_of(&h).await, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_marks_error_and_compensates() {
        let runner = ScriptedRunner::all_succeed()
            .delay_at(StepKey::CompileApplication, Duration::from_secs(20 * 60));
        let h = harness(5, 1, runner);
        let request =
            InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::VersionControl);

        let report = h.orchestrator.run(request).await.unwrap();
        assert_eq!(report.state, JobState::Failed);
        let failure = report.failure.unwrap();
        assert_eq!(failure.code, "TIMEOUT");
        assert_eq!(failure.step, Some(StepKey::CompileApplication));

        assert_eq!(balance_of(&h).await, 5);
        let job = h.orchestrator.snapshot(report.job_id).unwrap();
        let compile = job
            .tracker
            .steps()
            .iter()
            .find(|s| s.key == StepKey::CompileApplication)
            .unwrap();
        assert_eq!(compile.status, StepStatus::Error);
    }

    #[tokio::test]
    async fn spawn_failure_is_distinct() {
        let runner =
            ScriptedRunner::all_succeed().spawn_fail_at(StepKey::RunMigrations, "binary missing");
        let h = harness(5, 1, runner);
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let report = h.orchestrator.run(request).await.unwrap();
        let failure = report.failure.unwrap();
        assert_eq!(failure.code, "SPAWN_FAILED");
        assert_eq!(balance_of(&h).await, 5);
    }

    #[tokio::test]
    async fn explicit_cancel_compensates() {
        let runner = ScriptedRunner::all_succeed()
            .delay_at(StepKey::InstallDependencies, Duration::from_secs(30));
        let h = harness(5, 1, runner);
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let orchestrator = Arc::clone(&h.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.run(request).await });

        // Wait until the job reaches its slow step, then cancel it.
        let job_id = loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let jobs = h.orchestrator.jobs.read().unwrap();
            if let Some(slot) = jobs.values().next() {
                let job = slot.job.read().unwrap();
                if job.state == JobState::Running {
                    break job.id;
                }
            }
        };
        h.orchestrator.cancel(job_id, "user requested").unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.failure.unwrap().code, "CANCELLED");
        assert_eq!(balance_of(&h).await, 5);
    }

    #[tokio::test]
    async fn empty_domain_is_rejected() {
        let h = harness(5, 1, ScriptedRunner::all_succeed());
        let request = InstallRequest::new(h.partner_id, "  ", SourceKind::Package);
        let err = h.orchestrator.run(request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn unknown_partner_is_an_error_and_releases_the_domain() {
        let h = harness(5, 1, ScriptedRunner::all_succeed());
        let request =
            InstallRequest::new(PartnerId::generate(), "shop.example.com", SourceKind::Package);
        let err = h.orchestrator.run(request).await.unwrap_err();
        assert!(matches!(err, Error::PartnerNotFound { .. }));

        // The domain is free again.
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);
        let report = h.orchestrator.run(request).await.unwrap();
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn progress_percent_reaches_the_tracker() {
        let runner = ScriptedRunner::all_succeed()
            .progress_at(StepKey::CompileApplication, vec![40, 80]);
        let h = harness(5, 1, runner);
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let report = h.orchestrator.run(request).await.unwrap();
        assert!(report.succeeded());
        let job = h.orchestrator.snapshot(report.job_id).unwrap();
        let compile = job
            .tracker
            .steps()
            .iter()
            .find(|s| s.key == StepKey::CompileApplication)
            .unwrap();
        // Terminal success pins the step at 100.
        assert_eq!(compile.percent, Some(100));
    }

    #[tokio::test]
    async fn live_job_survives_sweeps_during_a_slow_step() {
        let runner = ScriptedRunner::all_succeed()
            .delay_at(StepKey::CompileApplication, Duration::from_millis(400));
        // Lease shorter than the step, as with the stock compile timeout.
        let config = ProvisionConfig {
            lease_ttl: Duration::from_millis(50),
            ..ProvisionConfig::default()
        };
        let h = harness_with_config(3, 1, runner, config);
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);

        let orchestrator = Arc::clone(&h.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.run(request).await });

        // Sweep repeatedly while the step is mid-flight, several lease
        // windows past step start. A job whose driver is still polling
        // the runner must never be reclaimed.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let swept = h.orchestrator.sweep_expired(Utc::now()).await.unwrap();
            assert!(swept.is_empty(), "a driven job was swept mid-step");
        }

        let report = handle.await.unwrap().unwrap();
        assert!(report.succeeded());
        assert_eq!(balance_of(&h).await, 2);
    }

    #[tokio::test]
    async fn terminal_jobs_are_evicted_after_the_retention_window() {
        let h = harness(3, 1, ScriptedRunner::all_succeed());
        let request = InstallRequest::new(h.partner_id, "shop.example.com", SourceKind::Package);
        let report = h.orchestrator.run(request).await.unwrap();
        assert!(report.succeeded());

        // Inside the retention window the snapshot stays queryable.
        let swept = h.orchestrator.sweep_expired(Utc::now()).await.unwrap();
        assert!(swept.is_empty());
        assert!(h.orchestrator.snapshot(report.job_id).is_some());

        // Past it the registry entry is dropped.
        let later = Utc::now() + chrono::Duration::hours(2);
        let swept = h.orchestrator.sweep_expired(later).await.unwrap();
        assert!(swept.is_empty());
        assert!(h.orchestrator.snapshot(report.job_id).is_none());
        assert!(h.orchestrator.jobs.read().unwrap().is_empty());
    }
}
