//! The deferred, chainable, awaitable `ProcessHandle` (spec.md §4.7).
//!
//! Rust has no ad hoc thenable protocol, so this is modeled as an
//! `IntoFuture`-implementing builder (SPEC_FULL.md §15): the chain methods
//! consume `&self` and return a fresh `ProcessHandle` (pre-launch,
//! immutable-config style, mirroring [`crate::engine::Engine`]); the first
//! `.await` (via `IntoFuture`) or explicit `.run()` call performs the
//! launch. The terminal outcome is cached behind a `tokio::sync::OnceCell`
//! so every awaiter — however many clones of the handle exist — observes
//! the same result (spec.md §4.7 "Re-awaiting yields the same terminal
//! result"), the same way `environment/docker/environment.rs` tracks one
//! `AtomicU8`-backed `ProcessState` shared by every observer of a container.

use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{Command, StdinSource};
use crate::error::{Result, XecError};
use crate::events::{EventKind, Payload};
use crate::result::ExecutionResult;
use crate::retry::RetryConfig;
use crate::runtime::{self, Resources};

const CONFIGURED: u8 = 0;
const LAUNCHING: u8 = 1;
const TERMINAL: u8 = 2;

struct Shared {
    status: AtomicU8,
    cancel: CancellationToken,
    cancel_event_emitted: std::sync::atomic::AtomicBool,
    cell: tokio::sync::OnceCell<std::result::Result<ExecutionResult, XecError>>,
    command_id: Uuid,
}

impl Shared {
    fn fresh() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(CONFIGURED),
            cancel: CancellationToken::new(),
            cancel_event_emitted: std::sync::atomic::AtomicBool::new(false),
            cell: tokio::sync::OnceCell::new(),
            command_id: Uuid::new_v4(),
        })
    }
}

/// A command that has been fully configured by [`crate::engine::Engine`]
/// but not necessarily launched yet (spec.md §4.7 state machine).
#[derive(Clone)]
pub struct ProcessHandle {
    pub(crate) command: Command,
    retry: RetryConfig,
    pub(crate) resources: Arc<Resources>,
    shared: Arc<Shared>,
}

impl ProcessHandle {
    pub(crate) fn new(command: Command, retry: RetryConfig, resources: Arc<Resources>) -> Self {
        Self { command, retry, resources, shared: Shared::fresh() }
    }

    fn check_configurable(&self) -> Result<()> {
        if self.shared.status.load(Ordering::Acquire) != CONFIGURED {
            return Err(XecError::InvalidState(
                "cannot reconfigure a ProcessHandle that has already launched".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns a new, independent, still-`Configured` handle over a modified
    /// command — chain methods never mutate `self` (spec.md §4.7 "return a
    /// new ProcessHandle").
    fn derive(&self, command: Command) -> Result<Self> {
        self.check_configurable()?;
        Ok(Self { command, retry: self.retry.clone(), resources: self.resources.clone(), shared: Shared::fresh() })
    }

    pub fn cwd(&self, path: impl Into<PathBuf>) -> Result<Self> {
        let mut command = self.command.clone();
        command.cwd = Some(path.into());
        self.derive(command)
    }

    pub fn env(&self, vars: std::collections::HashMap<String, String>) -> Result<Self> {
        let mut command = self.command.clone();
        command.env.extend(vars);
        self.derive(command)
    }

    pub fn timeout(&self, millis: u64) -> Result<Self> {
        let mut command = self.command.clone();
        command.timeout = Some(Duration::from_millis(millis));
        self.derive(command)
    }

    pub fn shell(&self, path: Option<impl Into<PathBuf>>) -> Result<Self> {
        let mut command = self.command.clone();
        command.shell = path.map(Into::into);
        self.derive(command)
    }

    pub fn retry(&self, retry: RetryConfig) -> Result<Self> {
        self.check_configurable()?;
        Ok(Self { command: self.command.clone(), retry, resources: self.resources.clone(), shared: Shared::fresh() })
    }

    pub fn quiet(&self) -> Result<Self> {
        let mut command = self.command.clone();
        command.quiet = true;
        self.derive(command)
    }

    pub fn nothrow(&self) -> Result<Self> {
        let mut command = self.command.clone();
        command.nothrow = true;
        self.derive(command)
    }

    pub fn interactive(&self) -> Result<Self> {
        let mut command = self.command.clone();
        command.interactive = true;
        self.derive(command)
    }

    pub fn raw(&self) -> Result<Self> {
        let mut command = self.command.clone();
        command.raw = true;
        self.derive(command)
    }

    pub fn stdin_text(&self, text: impl Into<String>) -> Result<Self> {
        let mut command = self.command.clone();
        command.stdin = StdinSource::Text(text.into());
        self.derive(command)
    }

    pub fn stdin_bytes(&self, bytes: Vec<u8>) -> Result<Self> {
        let mut command = self.command.clone();
        command.stdin = StdinSource::Bytes(bytes);
        self.derive(command)
    }

    /// Current lifecycle phase (spec.md §4.7). Coarsened to three
    /// observable phases — finer terminal distinctions (`Succeeded` vs
    /// `Failed` vs `Cancelled` vs `TimedOut`) are read off the awaited
    /// `Result` itself rather than polled separately, since Rust's
    /// `Result`/`Err` already carries that distinction.
    pub fn state(&self) -> HandleState {
        match self.shared.status.load(Ordering::Acquire) {
            CONFIGURED => HandleState::Configured,
            LAUNCHING => HandleState::Running,
            _ => HandleState::Terminal,
        }
    }

    /// Cancels the in-flight (or not-yet-launched) run. Idempotent: calling
    /// this on an already-terminal handle is a no-op, and at most one
    /// `command:cancel` event is ever emitted (spec.md §8 "Cancellation
    /// idempotence").
    pub fn cancel(&self) {
        if self.shared.status.load(Ordering::Acquire) == TERMINAL {
            return;
        }
        self.shared.cancel.cancel();
    }

    /// Launches the command on first call; every subsequent call (from any
    /// clone of this handle) returns the same cached terminal outcome
    /// (spec.md §4.7).
    pub async fn run(&self) -> Result<ExecutionResult> {
        self.shared.status.store(LAUNCHING, Ordering::Release);
        let result = self
            .shared
            .cell
            .get_or_init(|| self.execute())
            .await
            .clone();
        self.shared.status.store(TERMINAL, Ordering::Release);
        result
    }

    async fn execute(&self) -> std::result::Result<ExecutionResult, XecError> {
        if self.command.is_empty() {
            return Err(XecError::Validation("empty command".to_string()));
        }

        if self.command.cacheable {
            let key = crate::cache::fingerprint(&self.command);
            let command = self.command.clone();
            let retry = self.retry.clone();
            let resources = self.resources.clone();
            let shared = self.shared.clone();
            return self
                .resources
                .cache
                .get_or_compute(key, None, move || async move {
                    run_with_retry(&command, &retry, &resources, &shared).await
                })
                .await;
        }

        run_with_retry(&self.command, &self.retry, &self.resources, &self.shared).await
    }
}

/// Lifecycle phase as observed from outside (spec.md §4.7). Finer terminal
/// states are distinguished by the `Result` returned from `.run()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Configured,
    Running,
    Terminal,
}

async fn run_with_retry(
    command: &Command,
    retry: &RetryConfig,
    resources: &Resources,
    shared: &Shared,
) -> std::result::Result<ExecutionResult, XecError> {
    let mut attempt = 0u32;
    loop {
        let outcome = run_once(command, resources, shared).await;

        if let Err(err) = &outcome {
            if retry.should_retry(attempt, err) {
                let err = err.clone();
                let delay = retry.delay_for_attempt(attempt);
                resources.events.emit(
                    shared.command_id,
                    command.target.kind(),
                    EventKind::Retry,
                    Payload::Retry { attempt, delay_ms: delay.as_millis() as u64, prior_error: err.to_string() },
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
        }
        return outcome;
    }
}

async fn run_once(
    command: &Command,
    resources: &Resources,
    shared: &Shared,
) -> std::result::Result<ExecutionResult, XecError> {
    let started_at = Utc::now();
    let adapter_kind = command.target.kind();
    resources.events.emit(shared.command_id, adapter_kind, EventKind::Start, Payload::Empty);

    let mut process = match runtime::launch(resources, command).await {
        Ok(p) => p,
        Err(e) => {
            emit_error(resources, shared, adapter_kind, &e);
            return Err(e);
        }
    };

    if let StdinSource::Piped = command.stdin {
        // Fed externally by `crate::pipe`; nothing to write here.
    }

    let stdout_task = runtime::spawn_capture(
        process.take_stdout(),
        resources.redactor.clone(),
        command.quiet,
        resources.events.clone(),
        shared.command_id,
        adapter_kind.to_string(),
        EventKind::Stdout,
    );
    let stderr_task = runtime::spawn_capture(
        process.take_stderr(),
        resources.redactor.clone(),
        command.quiet,
        resources.events.clone(),
        shared.command_id,
        adapter_kind.to_string(),
        EventKind::Stderr,
    );

    let exit = match runtime::wait_with_discipline(process.as_mut(), command, &shared.cancel).await {
        Ok(exit) => exit,
        Err(e) => {
            stdout_task.abort();
            stderr_task.abort();
            if matches!(e, XecError::Cancelled)
                && !shared.cancel_event_emitted.swap(true, Ordering::AcqRel)
            {
                resources.events.emit(shared.command_id, adapter_kind, EventKind::Cancel, Payload::Empty);
            } else {
                emit_error(resources, shared, adapter_kind, &e);
            }
            return Err(e);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let _ = process.dispose().await;

    let finished_at = Utc::now();
    let result = ExecutionResult::from_parts(
        command,
        adapter_kind,
        stdout,
        stderr,
        exit.exit_code,
        exit.signal,
        started_at,
        finished_at,
    );

    resources.events.emit(shared.command_id, adapter_kind, EventKind::Complete, Payload::Empty);
    result.into_checked(command.nothrow)
}

fn emit_error(resources: &Resources, shared: &Shared, adapter_kind: &str, error: &XecError) {
    resources.events.emit(
        shared.command_id,
        adapter_kind,
        EventKind::Error,
        Payload::Message(error.to_string()),
    );
}

impl IntoFuture for ProcessHandle {
    type Output = Result<ExecutionResult>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.run().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::Resources;

    fn handle(invocation: &str) -> ProcessHandle {
        let resources = Arc::new(Resources::new(EngineConfig::default()).unwrap());
        let command = Command {
            invocation: crate::command::Invocation::Shell(invocation.to_string()),
            cwd: None,
            env: Default::default(),
            stdin: StdinSource::None,
            stdout_mode: crate::command::StdioMode::Capture,
            stderr_mode: crate::command::StdioMode::Capture,
            shell: Some(PathBuf::from("sh")),
            timeout: None,
            kill_signal: "SIGTERM".to_string(),
            kill_grace: Duration::from_secs(5),
            raw: false,
            interactive: false,
            nothrow: false,
            quiet: false,
            cacheable: false,
            target: crate::command::AdapterTarget::Local,
        };
        ProcessHandle::new(command, RetryConfig::default(), resources)
    }

    #[tokio::test]
    async fn successful_command_resolves_ok_true_and_null_cause() {
        let result = handle("echo hello").run().await.unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert!(result.ok());
        assert_eq!(result.cause(), None);
    }

    #[tokio::test]
    async fn non_zero_exit_raises_command_error_by_default() {
        let err = handle("exit 3").run().await.unwrap_err();
        match err {
            XecError::Command(r) => assert_eq!(r.exit_code, Some(3)),
            other => panic!("expected CommandError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothrow_converts_non_zero_exit_into_ok_false() {
        let h = handle("exit 3").nothrow().unwrap();
        let result = h.run().await.unwrap();
        assert!(!result.ok());
        assert_eq!(result.cause(), Some(crate::result::Cause::ExitCode(3)));
    }

    #[tokio::test]
    async fn repeated_awaits_return_the_same_cached_result() {
        let h = handle("echo once");
        let first = h.run().await.unwrap();
        let second = h.run().await.unwrap();
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(first.started_at, second.started_at);
    }

    #[tokio::test]
    async fn mutating_after_launch_fails_with_invalid_state() {
        let h = handle("sleep 0.2");
        let run_fut = h.run();
        tokio::pin!(run_fut);
        // Poll once to drive status to Launching without waiting for the
        // whole sleep.
        let _ = futures::poll!(&mut run_fut);
        assert!(matches!(h.timeout(100), Err(XecError::InvalidState(_))));
    }

    #[tokio::test]
    async fn timeout_kills_the_process_and_reports_timeout_error() {
        let h = handle("sleep 5").timeout(50).unwrap();
        let err = h.run().await.unwrap_err();
        assert!(matches!(err, XecError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal_cancel_is_a_no_op() {
        let h = handle("echo done");
        let _ = h.run().await;
        h.cancel();
        h.cancel();
    }
}
