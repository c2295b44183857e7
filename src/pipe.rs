//! Shell-style piping between [`ProcessHandle`]s (spec.md §4.8).
//!
//! A `Pipeline` is deliberately just a flat `Vec<ProcessHandle>` rather than
//! a nested `(left, right)` pair — appending to one list trivially satisfies
//! associativity (`a.pipe(b).pipe(c)` and `a.pipe(b.pipe(c))` both end up as
//! `[a, b, c]`), the same flattening trick `pipe.rs`'s shell-script forebear
//! (a POSIX pipeline is itself a flat list of stages, not a binary tree).

use tokio::io::AsyncWriteExt;

use crate::command::StdinSource;
use crate::error::{Result, XecError};
use crate::events::{EventKind, Payload};
use crate::handle::ProcessHandle;
use crate::result::ExecutionResult;
use crate::runtime;

/// An ordered chain of commands whose stdout feeds the next stage's stdin,
/// shell `|`-style (spec.md §4.8).
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<ProcessHandle>,
}

impl From<ProcessHandle> for Pipeline {
    fn from(handle: ProcessHandle) -> Self {
        Self { stages: vec![handle] }
    }
}

impl ProcessHandle {
    /// Starts (or extends) a pipeline with `next` reading this handle's
    /// stdout as its stdin. Accepts either another handle or an existing
    /// pipeline, flattening either way (spec.md §8 "Pipe associativity").
    pub fn pipe(&self, next: impl Into<Pipeline>) -> Pipeline {
        let mut stages = vec![self.clone()];
        stages.extend(next.into().stages);
        Pipeline { stages }
    }
}

impl Pipeline {
    /// Appends another stage, flattening rather than nesting (spec.md §8
    /// "Pipe associativity").
    pub fn pipe(mut self, next: impl Into<Pipeline>) -> Self {
        self.stages.extend(next.into().stages);
        self
    }

    /// Runs every stage concurrently, stdout→stdin chained between
    /// consecutive stages. Only the last stage's output is captured; only
    /// upstream *launch/IO* failures are propagated — a non-zero exit from
    /// an upstream stage does not fail the pipeline by itself, matching
    /// POSIX pipe semantics with no implicit `pipefail` (spec.md §4.8, §8
    /// scenario 7).
    pub async fn run(self) -> Result<ExecutionResult> {
        if self.stages.is_empty() {
            return Err(XecError::Validation("empty pipeline".to_string()));
        }
        if self.stages.len() == 1 {
            return self.stages.into_iter().next().unwrap().run().await;
        }
        if self.stages.iter().any(|s| s.command.cacheable) {
            return Err(XecError::Validation(
                "cache is not supported for a handle used as a pipe source or sink (spec.md §9 open question)"
                    .to_string(),
            ));
        }

        let upstream_display: Vec<String> =
            self.stages[..self.stages.len() - 1].iter().map(|h| h.command.display_invocation()).collect();

        // Every stage but the first reads from the previous stage's stdout
        // rather than its own configured stdin source (spec.md §4.8).
        let mut launches = Vec::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            let mut command = stage.command.clone();
            if i > 0 {
                command.stdin = StdinSource::Piped;
            }
            match runtime::launch(&stage.resources, &command).await {
                Ok(process) => launches.push(process),
                Err(e) => {
                    // A downstream stage's launch failed after upstream
                    // stages already started — tear those down before
                    // surfacing the error (spec.md §4.8 "b is cancelled
                    // before any of its bytes are written").
                    for mut already_launched in launches {
                        let _ = already_launched.dispose().await;
                    }
                    return Err(e);
                }
            }
        }

        // Wire each stage's stdout into the next stage's stdin, leaving the
        // last stage's stdout for capture.
        let mut bridges = Vec::new();
        for i in 0..launches.len() - 1 {
            let stdout = launches[i].take_stdout();
            let stdin = launches[i + 1].take_stdin();
            if let (Some(mut out), Some(mut inp)) = (stdout, stdin) {
                bridges.push(tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut out, &mut inp).await;
                    let _ = inp.shutdown().await;
                }));
            }
        }

        let last = self.stages.last().unwrap();
        let last_process = launches.last_mut().unwrap();
        let stdout_task = runtime::spawn_capture(
            last_process.take_stdout(),
            last.resources.redactor.clone(),
            last.command.quiet,
            last.resources.events.clone(),
            uuid::Uuid::new_v4(),
            last.command.target.kind().to_string(),
            EventKind::Stdout,
        );
        let stderr_task = runtime::spawn_capture(
            last_process.take_stderr(),
            last.resources.redactor.clone(),
            last.command.quiet,
            last.resources.events.clone(),
            uuid::Uuid::new_v4(),
            last.command.target.kind().to_string(),
            EventKind::Stderr,
        );

        let started_at = chrono::Utc::now();
        let cancel = tokio_util::sync::CancellationToken::new();
        let last_command = last.command.clone();
        let exit = match runtime::wait_with_discipline(last_process.as_mut(), &last_command, &cancel).await {
            Ok(exit) => exit,
            Err(e) => {
                stdout_task.abort();
                stderr_task.abort();
                for bridge in bridges {
                    bridge.abort();
                }
                for mut process in launches {
                    let _ = process.dispose().await;
                }
                return Err(e);
            }
        };

        for bridge in bridges {
            let _ = bridge.await;
        }
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let finished_at = chrono::Utc::now();

        for mut process in launches {
            let _ = process.dispose().await;
        }

        last.resources.events.emit(
            uuid::Uuid::new_v4(),
            last.command.target.kind(),
            EventKind::Complete,
            Payload::Empty,
        );

        let result = ExecutionResult::from_parts(
            &last_command,
            last_command.target.kind(),
            stdout,
            stderr,
            exit.exit_code,
            exit.signal,
            started_at,
            finished_at,
        )
        .with_piped_from(upstream_display.join(" | "));

        result.into_checked(last_command.nothrow)
    }
}

impl std::future::IntoFuture for Pipeline {
    type Output = Result<ExecutionResult>;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AdapterTarget, Command, Invocation, StdioMode};
    use crate::config::EngineConfig;
    use crate::retry::RetryConfig;
    use crate::runtime::Resources;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn shell_handle(script: &str) -> ProcessHandle {
        let resources = Arc::new(Resources::new(EngineConfig::default()).unwrap());
        let command = Command {
            invocation: Invocation::Shell(script.to_string()),
            cwd: None,
            env: Default::default(),
            stdin: StdinSource::None,
            stdout_mode: StdioMode::Capture,
            stderr_mode: StdioMode::Capture,
            shell: Some(PathBuf::from("sh")),
            timeout: None,
            kill_signal: "SIGTERM".to_string(),
            kill_grace: Duration::from_secs(5),
            raw: false,
            interactive: false,
            nothrow: false,
            quiet: false,
            cacheable: false,
            target: AdapterTarget::Local,
        };
        ProcessHandle::new(command, RetryConfig::default(), resources)
    }

    #[tokio::test]
    async fn pipes_stdout_into_the_next_stage_stdin() {
        let a = shell_handle("printf 'a\\nb\\nc\\n'");
        let b = shell_handle("grep b");
        let result = a.pipe(b).run().await.unwrap();
        assert_eq!(result.stdout, "b\n");
        assert!(result.ok());
    }

    #[tokio::test]
    async fn three_stage_pipeline_is_associative() {
        let a = shell_handle("printf 'a\\nb\\nc\\n'");
        let b = shell_handle("grep -v a");
        let c = shell_handle("grep -v c");

        let left: Pipeline = a.pipe(b.clone()).pipe(c.clone());
        let right = a.pipe(b.pipe(c));
        let left_result = left.run().await.unwrap();
        let right_result = right.run().await.unwrap();
        assert_eq!(left_result.stdout, right_result.stdout);
        assert_eq!(left_result.stdout, "b\n");
    }

    #[tokio::test]
    async fn upstream_non_zero_exit_does_not_fail_the_pipeline() {
        let a = shell_handle("printf 'a\\nb\\n'; exit 1");
        let b = shell_handle("grep b");
        let result = a.pipe(b).run().await.unwrap();
        assert!(result.ok());
        assert_eq!(result.stdout, "b\n");
    }

    #[tokio::test]
    async fn cacheable_stages_are_rejected() {
        let mut a = shell_handle("echo a");
        a.command.cacheable = true;
        let b = shell_handle("grep a");
        let err = a.pipe(b).run().await.unwrap_err();
        assert!(matches!(err, XecError::Validation(_)));
    }
}
