//! Step execution contract and test runners.
//!
//! Every provisioning step is delegated to an external operation through
//! the uniform [`StepRunner`] contract: the runner receives the job
//! domain, the accumulated outputs of prior steps, and step-specific
//! configuration; it returns a normalized success/error outcome and may
//! invoke a progress callback zero or more times before terminating.
//!
//! The orchestrator treats every step as opaque. Production deployments
//! use [`crate::process::CommandRunner`]; tests use the scripted runners
//! below.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::events::OutputStream;
use crate::step::{SourceKind, StepKey};

/// An incremental progress report from a running step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    /// Reported completion percent (0-100).
    pub percent: Option<u8>,
    /// Free-form message.
    pub message: Option<String>,
    /// Which output stream a free-form line came from, if it is one.
    pub stream: Option<OutputStream>,
}

impl StepProgress {
    /// A percent-only progress report.
    #[must_use]
    pub const fn percent(percent: u8) -> Self {
        Self {
            percent: Some(percent),
            message: None,
            stream: None,
        }
    }

    /// A free-form output line from the step's operation.
    #[must_use]
    pub fn line(stream: OutputStream, message: impl Into<String>) -> Self {
        Self {
            percent: None,
            message: Some(message.into()),
            stream: Some(stream),
        }
    }
}

/// Callback invoked by a step for incremental progress.
pub type ProgressSink<'a> = &'a (dyn Fn(StepProgress) + Send + Sync);

/// Input to a step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The domain being provisioned.
    pub domain: String,
    /// Where the application sources come from.
    pub source: SourceKind,
    /// Step-specific configuration.
    pub config: Value,
    /// Accumulated outputs of prior steps, keyed by step.
    pub artifacts: HashMap<StepKey, Value>,
}

impl StepContext {
    /// Creates a context for the given domain and source kind.
    #[must_use]
    pub fn new(domain: impl Into<String>, source: SourceKind) -> Self {
        Self {
            domain: domain.into(),
            source,
            config: Value::Null,
            artifacts: HashMap::new(),
        }
    }
}

/// Normalized failure from a step's external operation.
#[derive(Debug, Clone)]
pub struct StepFailure {
    /// Error message.
    pub message: String,
    /// Bounded tail of captured stdout, if any.
    pub stdout_tail: Option<String>,
    /// Bounded tail of captured stderr, if any.
    pub stderr_tail: Option<String>,
}

impl StepFailure {
    /// Creates a failure with just a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stdout_tail: None,
            stderr_tail: None,
        }
    }

    /// Attaches captured output tails.
    #[must_use]
    pub fn with_tails(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout_tail = stdout;
        self.stderr_tail = stderr;
        self
    }
}

/// Result of a step execution.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The operation completed successfully, optionally producing an
    /// artifact for later steps.
    Succeeded(Option<Value>),
    /// The operation ran and failed.
    Failed(StepFailure),
    /// The operation could not even start.
    SpawnFailed(String),
}

impl StepOutcome {
    /// Returns true if the step succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Trait for executing provisioning steps.
///
/// Implementations can shell out to external tools, call service APIs, or
/// anything else; the orchestrator only sees the normalized outcome.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Executes one step and returns its outcome.
    ///
    /// Implementations may call `progress` any number of times before
    /// returning. The call must not outlive the returned future; the
    /// orchestrator enforces the wall-clock timeout around it.
    async fn run(
        &self,
        step: StepKey,
        context: &StepContext,
        progress: ProgressSink<'_>,
    ) -> StepOutcome;
}

/// Scripted behavior for one step of a [`ScriptedRunner`].
#[derive(Debug, Clone, Default)]
struct ScriptedStep {
    /// Sleep this long before resolving (drives timeout tests).
    delay: Option<Duration>,
    /// Progress percents to report before resolving.
    progress: Vec<u8>,
    /// Output lines to report before resolving.
    lines: Vec<String>,
    /// Failure to resolve with; `None` means success.
    failure: Option<StepFailure>,
    /// Resolve as a spawn failure with this message.
    spawn_failure: Option<String>,
}

/// A configurable in-memory runner for tests.
///
/// Steps succeed immediately unless scripted otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    steps: HashMap<StepKey, ScriptedStep>,
}

impl ScriptedRunner {
    /// Creates a runner where every step succeeds immediately.
    #[must_use]
    pub fn all_succeed() -> Self {
        Self::default()
    }

    /// Scripts the given step to fail.
    #[must_use]
    pub fn fail_at(mut self, step: StepKey, failure: StepFailure) -> Self {
        self.steps.entry(step).or_default().failure = Some(failure);
        self
    }

    /// Scripts the given step to fail to spawn.
    #[must_use]
    pub fn spawn_fail_at(mut self, step: StepKey, message: impl Into<String>) -> Self {
        self.steps.entry(step).or_default().spawn_failure = Some(message.into());
        self
    }

    /// Scripts the given step to sleep before resolving.
    #[must_use]
    pub fn delay_at(mut self, step: StepKey, delay: Duration) -> Self {
        self.steps.entry(step).or_default().delay = Some(delay);
        self
    }

    /// Scripts the given step to report progress percents before
    /// resolving.
    #[must_use]
    pub fn progress_at(mut self, step: StepKey, percents: Vec<u8>) -> Self {
        self.steps.entry(step).or_default().progress = percents;
        self
    }

    /// Scripts the given step to emit output lines before resolving.
    #[must_use]
    pub fn lines_at(mut self, step: StepKey, lines: Vec<String>) -> Self {
        self.steps.entry(step).or_default().lines = lines;
        self
    }
}

#[async_trait]
impl StepRunner for ScriptedRunner {
    async fn run(
        &self,
        step: StepKey,
        _context: &StepContext,
        progress: ProgressSink<'_>,
    ) -> StepOutcome {
        let Some(script) = self.steps.get(&step) else {
            return StepOutcome::Succeeded(None);
        };

        if let Some(message) = &script.spawn_failure {
            return StepOutcome::SpawnFailed(message.clone());
        }

        for line in &script.lines {
            progress(StepProgress::line(OutputStream::Stdout, line.clone()));
        }
        for percent in &script.progress {
            progress(StepProgress::percent(*percent));
        }

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        match &script.failure {
            Some(failure) => StepOutcome::Failed(failure.clone()),
            None => StepOutcome::Succeeded(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn unscripted_steps_succeed() {
        let runner = ScriptedRunner::all_succeed();
        let ctx = StepContext::new("shop.example.com", SourceKind::Package);
        let outcome = runner.run(StepKey::CreateDatabase, &ctx, &|_| {}).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn scripted_failure_is_returned() {
        let runner = ScriptedRunner::all_succeed()
            .fail_at(StepKey::RunMigrations, StepFailure::new("syntax error"));
        let ctx = StepContext::new("shop.example.com", SourceKind::Package);
        let outcome = runner.run(StepKey::RunMigrations, &ctx, &|_| {}).await;
        assert!(matches!(outcome, StepOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn progress_callbacks_fire_in_order() {
        let runner = ScriptedRunner::all_succeed()
            .progress_at(StepKey::CompileApplication, vec![25, 50, 75]);
        let ctx = StepContext::new("shop.example.com", SourceKind::Package);
        let count = AtomicUsize::new(0);
        let outcome = runner
            .run(StepKey::CompileApplication, &ctx, &|p| {
                let seen = count.fetch_add(1, Ordering::SeqCst);
                assert_eq!(p.percent, Some(25 * (seen as u8 + 1)));
            })
            .await;
        assert!(outcome.is_success());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
