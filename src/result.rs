//! `ExecutionResult` — the terminal record of one command's run (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{Result, XecError};

/// How the process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cause {
    ExitCode(i32),
    Signal(String),
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cause::ExitCode(n) => write!(f, "exitCode: {n}"),
            Cause::Signal(s) => write!(f, "signal: {s}"),
        }
    }
}

/// Terminal record of a finished command, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub combined: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Display form of the command that produced this result (argv/shell
    /// string only — never the full `Command`, to avoid leaking secrets
    /// into serialized results).
    pub command: String,
    pub adapter_kind: String,
    /// Set by [`crate::pipe`] when this result came off the last stage of a
    /// pipeline — the display form of the upstream command it read from.
    #[serde(default)]
    pub piped_from: Option<String>,
}

impl ExecutionResult {
    pub fn from_parts(
        command: &Command,
        adapter_kind: &str,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        signal: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let combined = if stderr.is_empty() {
            stdout.clone()
        } else if stdout.is_empty() {
            stderr.clone()
        } else {
            format!("{stdout}{stderr}")
        };
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            stdout,
            stderr,
            combined,
            exit_code,
            signal,
            duration_ms,
            started_at,
            finished_at,
            command: command.display_invocation(),
            adapter_kind: adapter_kind.to_string(),
            piped_from: None,
        }
    }

    /// Tags this result as the tail of a pipeline (spec.md §4.3 `.pipe()`).
    pub fn with_piped_from(mut self, upstream: String) -> Self {
        self.piped_from = Some(upstream);
        self
    }

    /// `ok = exit_code == 0`, per spec.md §3 and the `isSuccess()`/`.ok`
    /// equivalence in §7.
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Deprecated alias kept for parity with the original API surface.
    #[deprecated(note = "use `.ok()` instead")]
    pub fn is_success(&self) -> bool {
        self.ok()
    }

    pub fn cause(&self) -> Option<Cause> {
        if self.ok() {
            return None;
        }
        if let Some(sig) = &self.signal {
            return Some(Cause::Signal(sig.clone()));
        }
        self.exit_code.map(Cause::ExitCode)
    }

    pub fn text(&self) -> &str {
        &self.stdout
    }

    pub fn lines(&self) -> Vec<&str> {
        self.stdout.split('\n').collect()
    }

    pub fn buffer(&self) -> Vec<u8> {
        self.stdout.clone().into_bytes()
    }

    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_str(&self.stdout)
            .map_err(|e| XecError::InvalidArgument(format!("stdout is not valid JSON: {e}")))
    }

    /// Raise a `CommandError`-equivalent unless `nothrow` converted this
    /// result into an always-`Ok` resolution already.
    pub fn into_checked(self, nothrow: bool) -> Result<ExecutionResult> {
        if nothrow || self.ok() {
            Ok(self)
        } else {
            Err(XecError::Command(Box::new(self)))
        }
    }
}
