//! External command execution for provisioning steps.
//!
//! [`CommandRunner`] is the production [`StepRunner`]: each step maps to
//! one external command, spawned with piped output. Stdout and stderr are
//! streamed line by line to the progress sink and kept in bounded tail
//! buffers for the failure report.
//!
//! A tool may report incremental completion by printing a line of the
//! form `PROGRESS <n>` (0-100) to stdout; such lines are forwarded as
//! percent updates instead of log output.
//!
//! Termination is two-phase. The orchestrator enforces the wall-clock
//! timeout by dropping the runner's future; the dropped child is first
//! asked to stop with SIGTERM and, if still alive after the configured
//! grace window, force-killed.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::events::OutputStream;
use crate::runner::{ProgressSink, StepContext, StepFailure, StepOutcome, StepProgress, StepRunner};
use crate::step::StepKey;

/// A command template for one step.
///
/// Arguments may contain the placeholder `{domain}`, replaced with the
/// job's domain at spawn time.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, after placeholder substitution.
    pub args: Vec<String>,
    /// Working directory, if any.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    /// Creates a spec for the given program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self, context: &StepContext) -> Command {
        let mut command = Command::new(&self.program);
        for arg in &self.args {
            command.arg(arg.replace("{domain}", &context.domain));
        }
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd.replace("{domain}", &context.domain));
        }
        for (key, value) in &self.envs {
            command.env(key, value.replace("{domain}", &context.domain));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Maps steps to the commands that implement them.
pub trait CommandPlanner: Send + Sync {
    /// Returns the command for a step, or `None` if the step has no
    /// registered command.
    fn plan(&self, step: StepKey, context: &StepContext) -> Option<CommandSpec>;
}

/// A static step-to-command table.
#[derive(Debug, Default)]
pub struct CommandTable {
    specs: HashMap<StepKey, CommandSpec>,
}

impl CommandTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the command for a step, replacing any previous entry.
    #[must_use]
    pub fn with(mut self, step: StepKey, spec: CommandSpec) -> Self {
        self.specs.insert(step, spec);
        self
    }
}

impl CommandPlanner for CommandTable {
    fn plan(&self, step: StepKey, _context: &StepContext) -> Option<CommandSpec> {
        self.specs.get(&step).cloned()
    }
}

/// Line-oriented tail buffer bounded by total bytes.
#[derive(Debug)]
struct TailBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl TailBuffer {
    fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit {
            let Some(dropped) = self.lines.pop_front() else {
                break;
            };
            self.bytes -= dropped.len() + 1;
        }
    }

    fn into_tail(self) -> Option<String> {
        if self.lines.is_empty() {
            return None;
        }
        Some(self.lines.into_iter().collect::<Vec<_>>().join("\n"))
    }
}

/// Ensures an abandoned child is terminated gracefully, then forcibly.
///
/// When the runner's future is dropped mid-execution (wall-clock timeout
/// or job cancellation), the guard detaches a task that sends SIGTERM,
/// waits out the grace window, and force-kills whatever is left.
struct ChildGuard {
    child: Option<Child>,
    grace: Duration,
}

impl ChildGuard {
    fn new(child: Child, grace: Duration) -> Self {
        Self {
            child: Some(child),
            grace,
        }
    }

    fn child_mut(&mut self) -> &mut Child {
        self.child.as_mut().unwrap_or_else(|| unreachable!())
    }

    /// Takes the child back for a normal wait, disarming the guard.
    fn disarm(mut self) -> Child {
        self.child.take().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let grace = self.grace;
        #[allow(clippy::cast_possible_wrap)]
        let pid = child.id().map(|id| id as i32);
        tokio::spawn(async move {
            #[cfg(unix)]
            if let Some(pid) = pid {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            #[cfg(not(unix))]
            let _ = pid;

            tokio::select! {
                _ = child.wait() => {}
                () = tokio::time::sleep(grace) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        });
    }
}

/// Production step runner that shells out to external commands.
pub struct CommandRunner {
    planner: Arc<dyn CommandPlanner>,
    kill_grace: Duration,
    tail_bytes: usize,
}

impl std::fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRunner")
            .field("kill_grace", &self.kill_grace)
            .field("tail_bytes", &self.tail_bytes)
            .finish_non_exhaustive()
    }
}

impl CommandRunner {
    /// Creates a runner over the given planner.
    #[must_use]
    pub fn new(planner: Arc<dyn CommandPlanner>, kill_grace: Duration, tail_bytes: usize) -> Self {
        Self {
            planner,
            kill_grace,
            tail_bytes,
        }
    }

    async fn execute(
        &self,
        spec: &CommandSpec,
        context: &StepContext,
        progress: ProgressSink<'_>,
    ) -> StepOutcome {
        let mut command = spec.build(context);
        let mut child = match command.spawn() {
            Ok(child) => ChildGuard::new(child, self.kill_grace),
            Err(error) => {
                return StepOutcome::SpawnFailed(format!(
                    "failed to spawn {}: {error}",
                    spec.program
                ));
            }
        };

        // The handles always exist: the command was configured with pipes.
        let Some(stdout) = child.child_mut().stdout.take() else {
            return StepOutcome::SpawnFailed("stdout pipe missing".into());
        };
        let Some(stderr) = child.child_mut().stderr.take() else {
            return StepOutcome::SpawnFailed("stderr pipe missing".into());
        };

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();
        let mut stdout_tail = TailBuffer::new(self.tail_bytes);
        let mut stderr_tail = TailBuffer::new(self.tail_bytes);
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_lines.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(percent) = parse_progress_line(&line) {
                                progress(StepProgress::percent(percent));
                            } else {
                                stdout_tail.push(&line);
                                progress(StepProgress::line(OutputStream::Stdout, line));
                            }
                        }
                        Ok(None) | Err(_) => stdout_open = false,
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => {
                            stderr_tail.push(&line);
                            progress(StepProgress::line(OutputStream::Stderr, line));
                        }
                        Ok(None) | Err(_) => stderr_open = false,
                    }
                }
            }
        }

        let mut child = child.disarm();
        let status = match child.wait().await {
            Ok(status) => status,
            Err(error) => {
                return StepOutcome::Failed(
                    StepFailure::new(format!("failed to wait for {}: {error}", spec.program))
                        .with_tails(stdout_tail.into_tail(), stderr_tail.into_tail()),
                );
            }
        };

        if status.success() {
            StepOutcome::Succeeded(None)
        } else {
            StepOutcome::Failed(
                StepFailure::new(format!("{} exited with {status}", spec.program))
                    .with_tails(stdout_tail.into_tail(), stderr_tail.into_tail()),
            )
        }
    }
}

/// Parses the `PROGRESS <n>` reporting convention.
fn parse_progress_line(line: &str) -> Option<u8> {
    let rest = line.strip_prefix("PROGRESS ")?;
    rest.trim().parse::<u8>().ok().map(|p| p.min(100))
}

#[async_trait]
impl StepRunner for CommandRunner {
    async fn run(
        &self,
        step: StepKey,
        context: &StepContext,
        progress: ProgressSink<'_>,
    ) -> StepOutcome {
        let Some(spec) = self.planner.plan(step, context) else {
            return StepOutcome::SpawnFailed(format!("no command registered for step {step}"));
        };
        tracing::debug!(%step, program = %spec.program, "spawning step command");
        self.execute(&spec, context, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::SourceKind;
    use std::sync::Mutex;

    fn runner_for(step: StepKey, spec: CommandSpec) -> CommandRunner {
        let planner = Arc::new(CommandTable::new().with(step, spec));
        CommandRunner::new(planner, Duration::from_millis(100), 16 * 1024)
    }

    fn ctx() -> StepContext {
        StepContext::new("shop.example.com", SourceKind::Package)
    }

    #[test]
    fn tail_buffer_keeps_the_newest_lines() {
        let mut tail = TailBuffer::new(16);
        tail.push("first line");
        tail.push("second");
        tail.push("third");
        let text = tail.into_tail().unwrap();
        assert!(!text.contains("first"));
        assert!(text.contains("third"));
    }

    #[test]
    fn progress_lines_parse() {
        assert_eq!(parse_progress_line("PROGRESS 42"), Some(42));
        assert_eq!(parse_progress_line("PROGRESS 250"), Some(100));
        assert_eq!(parse_progress_line("progress 42"), None);
        assert_eq!(parse_progress_line("PROGRESS x"), None);
    }

    #[tokio::test]
    async fn unregistered_step_is_a_spawn_failure() {
        let runner = runner_for(StepKey::CreateDatabase, CommandSpec::new("true"));
        let outcome = runner.run(StepKey::RunMigrations, &ctx(), &|_| {}).await;
        assert!(matches!(outcome, StepOutcome::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_command_succeeds() {
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("echo configuring {domain}");
        let runner = runner_for(StepKey::WriteEnvironment, spec);

        let lines = Mutex::new(Vec::new());
        let outcome = runner
            .run(StepKey::WriteEnvironment, &ctx(), &|p| {
                if let Some(message) = p.message {
                    lines.lock().unwrap().push(message);
                }
            })
            .await;
        assert!(outcome.is_success());
        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["configuring shop.example.com"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_captures_stderr_tail() {
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo some output; echo boom >&2; exit 3");
        let runner = runner_for(StepKey::RunMigrations, spec);

        let outcome = runner.run(StepKey::RunMigrations, &ctx(), &|_| {}).await;
        match outcome {
            StepOutcome::Failed(failure) => {
                assert!(failure.message.contains("exited with"));
                assert_eq!(failure.stdout_tail.as_deref(), Some("some output"));
                assert_eq!(failure.stderr_tail.as_deref(), Some("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn progress_convention_reports_percent() {
        let spec = CommandSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo PROGRESS 40; echo PROGRESS 80; echo done");
        let runner = runner_for(StepKey::CompileApplication, spec);

        let percents = Mutex::new(Vec::new());
        let outcome = runner
            .run(StepKey::CompileApplication, &ctx(), &|p| {
                if let Some(percent) = p.percent {
                    percents.lock().unwrap().push(percent);
                }
            })
            .await;
        assert!(outcome.is_success());
        assert_eq!(percents.lock().unwrap().as_slice(), [40, 80]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let spec = CommandSpec::new("/nonexistent/tool");
        let runner = runner_for(StepKey::CreateDatabase, spec);
        let outcome = runner.run(StepKey::CreateDatabase, &ctx(), &|_| {}).await;
        assert!(matches!(outcome, StepOutcome::SpawnFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_execution_terminates_the_child() {
        let spec = CommandSpec::new("/bin/sh").arg("-c").arg("sleep 30");
        let runner = runner_for(StepKey::InstallDependencies, spec);

        let result = tokio::time::timeout(
            Duration::from_millis(200),
            runner.run(StepKey::InstallDependencies, &ctx(), &|_| {}),
        )
        .await;
        assert!(result.is_err(), "command should outlive the window");
        // The guard's detached task reaps the child; give it a moment.
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}
