//! Parallel coordination over independent [`ProcessHandle`]s (spec.md §4.9).
//!
//! Built on `futures::stream::FuturesUnordered`, the same combinator the
//! teacher reaches for in `api/client.rs`'s batched webhook dispatch —
//! generalized here from "fire N requests, collect N responses" to the
//! richer `all`/`settled`/`race`/`map`/`filter`/`some`/`every`/`batch` set.
//! Every helper preserves *input* order in its returned `Vec`, even though
//! completion order is whatever `FuturesUnordered` yields.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use crate::error::{Result, XecError};
use crate::handle::ProcessHandle;
use crate::result::ExecutionResult;

/// Runs every handle concurrently and returns all results in the original
/// order. Cancels every sibling as soon as one fails (spec.md §4.9 "fail
/// fast") and returns that first error.
pub async fn all(handles: Vec<ProcessHandle>) -> Result<Vec<ExecutionResult>> {
    let n = handles.len();
    let mut indexed: FuturesUnordered<_> = handles
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.clone();
            async move { (i, h.run().await) }
        })
        .collect();

    let mut out: Vec<Option<ExecutionResult>> = (0..n).map(|_| None).collect();
    while let Some((i, result)) = indexed.next().await {
        match result {
            Ok(r) => out[i] = Some(r),
            Err(e) => {
                for h in &handles {
                    h.cancel();
                }
                return Err(e);
            }
        }
    }
    Ok(out.into_iter().map(|o| o.expect("every handle resolved before the stream drained")).collect())
}

/// The outcome of one handle in a [`settled`] batch — never short-circuits,
/// so unlike [`all`] this always runs every handle to completion.
#[derive(Debug, Clone)]
pub enum Settled {
    Fulfilled(ExecutionResult),
    Rejected(XecError),
}

/// Runs every handle concurrently to completion regardless of failures,
/// returning one [`Settled`] per handle in input order (spec.md §4.9
/// "settled never short-circuits").
pub async fn settled(handles: Vec<ProcessHandle>) -> Vec<Settled> {
    let n = handles.len();
    let mut indexed: FuturesUnordered<_> = handles
        .into_iter()
        .enumerate()
        .map(|(i, h)| async move { (i, h.run().await) })
        .collect();

    let mut out: Vec<Option<Settled>> = (0..n).map(|_| None).collect();
    while let Some((i, result)) = indexed.next().await {
        out[i] = Some(match result {
            Ok(r) => Settled::Fulfilled(r),
            Err(e) => Settled::Rejected(e),
        });
    }
    out.into_iter().map(|o| o.expect("every handle resolved before the stream drained")).collect()
}

/// Returns the first handle to settle (success or failure), cancelling the
/// rest (spec.md §4.9 "race").
pub async fn race(handles: Vec<ProcessHandle>) -> Result<ExecutionResult> {
    let mut indexed: FuturesUnordered<_> = handles
        .iter()
        .map(|h| {
            let h = h.clone();
            async move { h.run().await }
        })
        .collect();

    let first = indexed.next().await.expect("race requires at least one handle");
    for h in &handles {
        h.cancel();
    }
    first
}

/// Maps `items` through `f` into handles, runs them with bounded
/// concurrency, and collects results in input order (spec.md §4.9 "map").
/// `concurrency` of `0` means unbounded.
pub async fn map<T, F>(items: Vec<T>, concurrency: usize, f: F) -> Result<Vec<ExecutionResult>>
where
    F: Fn(&T) -> ProcessHandle,
{
    let handles: Vec<ProcessHandle> = items.iter().map(&f).collect();
    if concurrency == 0 {
        return all(handles).await;
    }
    match batch(handles, BatchOptions { concurrency, ..BatchOptions::default() }).await {
        BatchOutcome::FailFast(result) => result,
        BatchOutcome::Collected(_) => unreachable!("map always requests BatchMode::FailFast"),
    }
}

/// Selects whether [`batch`] stops at the first failure (cancelling the
/// rest, like [`all`]) or runs every handle to completion and reports every
/// outcome (like [`settled`]) — spec.md §4.9 "on failure behaviour
/// selectable between fail-fast and collect".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    FailFast,
    Collect,
}

/// `(done, total, ok, fail)` reported to [`BatchOptions::on_progress`] after
/// each handle settles (spec.md §4.9 "progress callbacks").
pub type ProgressFn = Arc<dyn Fn(usize, usize, usize, usize) + Send + Sync>;

/// Options for [`batch`] (spec.md §4.9 `batch(items, {concurrency=5,
/// on-progress})`).
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// `0` means unbounded. Spec default is `5`; use
    /// `BatchOptions { concurrency: 5, ..Default::default() }` or
    /// [`BatchOptions::with_concurrency`] for that default explicitly.
    pub concurrency: usize,
    pub mode: BatchMode,
    pub on_progress: Option<ProgressFn>,
}

impl Default for BatchMode {
    fn default() -> Self {
        BatchMode::FailFast
    }
}

impl BatchOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self { concurrency, ..Self::default() }
    }
}

/// The result of [`batch`], shaped by the [`BatchMode`] the caller asked
/// for: a single fail-fast [`Result`] over every result, or the full set of
/// per-handle [`Settled`] outcomes.
pub enum BatchOutcome {
    FailFast(Result<Vec<ExecutionResult>>),
    Collected(Vec<Settled>),
}

/// Rate-limited execution with progress callbacks (spec.md §4.9 "batch").
/// Runs at most `options.concurrency` handles at once (`0` = unbounded),
/// reporting `(done, total, ok, fail)` to `options.on_progress` as each
/// handle settles, and behaving per `options.mode` on failure.
pub async fn batch(handles: Vec<ProcessHandle>, options: BatchOptions) -> BatchOutcome {
    let n = handles.len();
    let semaphore = (options.concurrency > 0).then(|| Arc::new(Semaphore::new(options.concurrency)));
    let done = Arc::new(AtomicUsize::new(0));
    let ok_count = Arc::new(AtomicUsize::new(0));
    let fail_count = Arc::new(AtomicUsize::new(0));

    let mut indexed: FuturesUnordered<_> = handles
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = h.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = match &semaphore {
                    Some(s) => Some(s.acquire_owned().await.expect("semaphore never closed")),
                    None => None,
                };
                (i, h.run().await)
            }
        })
        .collect();

    let mut out: Vec<Option<std::result::Result<ExecutionResult, XecError>>> = (0..n).map(|_| None).collect();
    let mut failed = false;
    while let Some((i, result)) = indexed.next().await {
        done.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(_) => {
                ok_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                fail_count.fetch_add(1, Ordering::Relaxed);
                failed = true;
            }
        }
        if let Some(cb) = &options.on_progress {
            cb(done.load(Ordering::Relaxed), n, ok_count.load(Ordering::Relaxed), fail_count.load(Ordering::Relaxed));
        }
        let is_err = result.is_err();
        out[i] = Some(result);
        if options.mode == BatchMode::FailFast && is_err {
            for h in &handles {
                h.cancel();
            }
            break;
        }
    }

    match options.mode {
        BatchMode::FailFast => {
            if failed {
                let err = out
                    .into_iter()
                    .flatten()
                    .find_map(|r| r.err())
                    .expect("failed=true implies at least one Err present");
                BatchOutcome::FailFast(Err(err))
            } else {
                BatchOutcome::FailFast(Ok(out
                    .into_iter()
                    .map(|o| o.expect("every handle resolved before the stream drained").expect("fail-fast mode with no failures"))
                    .collect()))
            }
        }
        BatchMode::Collect => BatchOutcome::Collected(
            out.into_iter()
                .map(|o| match o.expect("every handle resolved before the stream drained") {
                    Ok(r) => Settled::Fulfilled(r),
                    Err(e) => Settled::Rejected(e),
                })
                .collect(),
        ),
    }
}

/// Runs every handle, returning only those whose result satisfies
/// `predicate` (spec.md §4.9 "filter"). Never short-circuits — a filtered-
/// out or failed handle just doesn't appear in the output.
pub async fn filter<F>(handles: Vec<ProcessHandle>, predicate: F) -> Vec<ExecutionResult>
where
    F: Fn(&ExecutionResult) -> bool,
{
    settled(handles)
        .await
        .into_iter()
        .filter_map(|s| match s {
            Settled::Fulfilled(r) if predicate(&r) => Some(r),
            _ => None,
        })
        .collect()
}

/// True as soon as any handle succeeds; cancels the rest once known
/// (spec.md §4.9 "some").
pub async fn some(handles: Vec<ProcessHandle>) -> bool {
    let mut indexed: FuturesUnordered<_> = handles
        .iter()
        .map(|h| {
            let h = h.clone();
            async move { h.run().await }
        })
        .collect();

    while let Some(result) = indexed.next().await {
        if result.is_ok() {
            for h in &handles {
                h.cancel();
            }
            return true;
        }
    }
    false
}

/// True only if every handle succeeds; cancels the rest as soon as one
/// fails (spec.md §4.9 "every").
pub async fn every(handles: Vec<ProcessHandle>) -> bool {
    let mut indexed: FuturesUnordered<_> = handles
        .iter()
        .map(|h| {
            let h = h.clone();
            async move { h.run().await }
        })
        .collect();

    while let Some(result) = indexed.next().await {
        if result.is_err() {
            for h in &handles {
                h.cancel();
            }
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AdapterTarget, Command, Invocation, StdinSource, StdioMode};
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
    async fn all_preserves_input_order_regardless_of_completion_order() {
        let handles = vec![
            shell_handle("sleep 0.05; echo first"),
            shell_handle("echo second"),
        ];
        let results = all(handles).await.unwrap();
        assert_eq!(results[0].stdout, "first\n");
        assert_eq!(results[1].stdout, "second\n");
    }

    #[tokio::test]
    async fn all_fails_fast_on_first_error() {
        let handles = vec![shell_handle("exit 1"), shell_handle("sleep 1; echo late")];
        let err = all(handles).await.unwrap_err();
        assert!(matches!(err, XecError::Command(_)));
    }

    #[tokio::test]
    async fn settled_never_short_circuits() {
        let handles = vec![shell_handle("exit 1"), shell_handle("echo ok")];
        let results = settled(handles).await;
        assert!(matches!(results[0], Settled::Rejected(_)));
        assert!(matches!(results[1], Settled::Fulfilled(_)));
    }

    #[tokio::test]
    async fn race_returns_the_first_to_finish() {
        let handles = vec![shell_handle("sleep 1; echo slow"), shell_handle("echo fast")];
        let result = race(handles).await.unwrap();
        assert_eq!(result.stdout, "fast\n");
    }

    #[tokio::test]
    async fn every_is_false_when_any_fails() {
        let handles = vec![shell_handle("echo ok"), shell_handle("exit 1")];
        assert!(!every(handles).await);
    }

    #[tokio::test]
    async fn some_is_true_when_any_succeeds() {
        let handles = vec![shell_handle("exit 1"), shell_handle("echo ok")];
        assert!(some(handles).await);
    }

    #[tokio::test]
    async fn batch_collect_mode_runs_every_handle_and_reports_progress() {
        let handles = vec![shell_handle("echo a"), shell_handle("exit 1"), shell_handle("echo c")];
        let progress_calls = Arc::new(AtomicUsize::new(0));
        let counter = progress_calls.clone();
        let options = BatchOptions {
            concurrency: 2,
            mode: BatchMode::Collect,
            on_progress: Some(Arc::new(move |_done, total, _ok, _fail| {
                assert_eq!(total, 3);
                counter.fetch_add(1, Ordering::Relaxed);
            })),
        };
        let outcome = batch(handles, options).await;
        let BatchOutcome::Collected(results) = outcome else {
            panic!("expected Collected outcome");
        };
        assert!(matches!(results[0], Settled::Fulfilled(_)));
        assert!(matches!(results[1], Settled::Rejected(_)));
        assert!(matches!(results[2], Settled::Fulfilled(_)));
        assert_eq!(progress_calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn batch_fail_fast_mode_cancels_remaining_handles_on_first_error() {
        let handles = vec![shell_handle("exit 1"), shell_handle("sleep 1; echo late")];
        let outcome = batch(handles, BatchOptions::with_concurrency(2)).await;
        let BatchOutcome::FailFast(result) = outcome else {
            panic!("expected FailFast outcome");
        };
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn map_runs_with_bounded_concurrency_and_preserves_order() {
        let items = vec!["first", "second", "third"];
        let results = map(items, 2, |s| shell_handle(&format!("echo {s}"))).await.unwrap();
        assert_eq!(results[0].stdout, "first\n");
        assert_eq!(results[1].stdout, "second\n");
        assert_eq!(results[2].stdout, "third\n");
    }
}
