//! Adapter polymorphism: one capability set, dispatched by tagged variant
//! rather than inheritance (spec.md §9 "Adapter polymorphism"; SPEC_FULL.md
//! §13).
//!
//! Shaped directly on the teacher's `environment::traits::ProcessEnvironment`
//! (`launch`-equivalent lifecycle ops returning a narrow `Result`, an
//! `async_trait`, `CancellationToken` threaded through long-running calls) —
//! generalized from "one long-lived container" to "one command launch that
//! returns a stream handle."

pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod ssh;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::command::{AdapterTarget, Command};
use crate::error::{Result, XecError};

/// How a launched process ended, reported by [`RunningProcess::wait`].
#[derive(Debug, Clone, Default)]
pub struct Exit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

pub type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// One in-flight launch. Adapters hand one of these back from `launch`;
/// the [`crate::handle::ProcessHandle`] drives it to completion, draining
/// streams as configured by the command's [`crate::command::StdioMode`]s.
#[async_trait]
pub trait RunningProcess: Send {
    /// Takes the stdout stream, if the command requested capture or
    /// streaming. Called at most once.
    fn take_stdout(&mut self) -> Option<BoxedRead>;

    /// Takes the stderr stream, if the command requested capture or
    /// streaming. Called at most once.
    fn take_stderr(&mut self) -> Option<BoxedRead>;

    /// Takes the stdin sink, if the command provided input or is
    /// `interactive`/piped-into. Called at most once.
    fn take_stdin(&mut self) -> Option<BoxedWrite>;

    /// Waits for the process/channel to finish and reports how it ended.
    async fn wait(&mut self) -> Result<Exit>;

    /// Delivers a signal (best-effort translated per substrate — e.g. a
    /// Kubernetes exec channel close stands in for SIGKILL).
    async fn signal(&mut self, signal: &str) -> Result<()>;

    /// Releases any resources held for this run (ephemeral container
    /// removal, exec channel close, pooled connection release). Idempotent.
    async fn dispose(&mut self) -> Result<()>;
}

/// The capability set every substrate implements (spec.md §9).
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn launch(&self, command: &Command) -> Result<Box<dyn RunningProcess>>;
}

/// Picks the adapter implementation for a command's [`AdapterTarget`].
///
/// `Local` is always available; the others are constructed lazily and
/// cached by [`crate::engine::Engine`] (ssh pool, docker client, kube
/// client), since each carries its own connection state.
pub fn kind_for(target: &AdapterTarget) -> &'static str {
    target.kind()
}

/// Holds the oneshot-channel end of a background task's exit report,
/// re-pollable so [`crate::handle`] can race `wait()` against a timeout/
/// cancellation more than once (grace-period retry after an elapsed
/// deadline) without the background task's single send being consumed by a
/// `wait()` call whose future got dropped before it resolved.
pub(crate) struct ExitSlot {
    rx: oneshot::Receiver<Exit>,
    resolved: Option<Exit>,
}

impl ExitSlot {
    pub(crate) fn new(rx: oneshot::Receiver<Exit>) -> Self {
        Self { rx, resolved: None }
    }

    pub(crate) async fn wait(&mut self) -> Result<Exit> {
        if let Some(exit) = &self.resolved {
            return Ok(exit.clone());
        }
        let rx = &mut self.rx;
        let exit = std::future::poll_fn(|cx| Pin::new(&mut *rx).poll(cx))
            .await
            .map_err(|_| XecError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "exit channel task dropped")))?;
        self.resolved = Some(exit.clone());
        Ok(exit)
    }
}
