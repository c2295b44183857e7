//! Shared plumbing between [`crate::handle`] and [`crate::pipe`]: adapter
//! dispatch, redacted chunked capture, and the timeout/grace/kill escalation
//! discipline (spec.md §4.3, §4.7, §5). Factored out so both call sites
//! share one implementation of "how a launched process is driven to its
//! exit" instead of each re-deriving the timeout/cancel race.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::adapters::docker::DockerAdapter;
use crate::adapters::kubernetes::KubernetesAdapter;
use crate::adapters::local::LocalAdapter;
use crate::adapters::ssh::SshAdapter;
use crate::adapters::{Adapter, BoxedRead, Exit, RunningProcess};
use crate::cache::ResultCache;
use crate::command::{AdapterTarget, Command};
use crate::config::EngineConfig;
use crate::error::{Result, XecError};
use crate::events::{EventBus, EventKind, Payload};
use crate::redact::Redactor;

/// Everything a launched [`Command`] needs that outlives any single
/// [`crate::handle::ProcessHandle`] — adapter instances, the shared event
/// bus/cache/redactor. Owned by [`crate::engine::Engine`] and handed to
/// every handle it produces (spec.md §5 "Docker client: shared, stateless
/// between calls"; "Event bus and cache: shared process-wide per engine").
pub(crate) struct Resources {
    pub config: EngineConfig,
    pub events: EventBus,
    pub cache: ResultCache,
    pub redactor: Redactor,
    local: Arc<LocalAdapter>,
    pub(crate) ssh: Arc<SshAdapter>,
    docker: OnceCell<Arc<DockerAdapter>>,
    k8s: OnceCell<Arc<KubernetesAdapter>>,
}

impl Resources {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let redactor = Redactor::new(&config.redact_patterns)
            .map_err(|e| XecError::Validation(format!("invalid redact pattern: {e}")))?;
        let events = EventBus::new();
        let ssh = Arc::new(SshAdapter::new(
            config.ssh_pool.max_per_key,
            config.ssh_pool.idle_ttl,
            config.ssh_pool.acquire_timeout,
            events.clone(),
        ));
        Ok(Self {
            cache: ResultCache::new(config.cache.max_bytes, config.cache.ttl),
            events,
            redactor,
            local: Arc::new(LocalAdapter::new()),
            ssh,
            docker: OnceCell::new(),
            k8s: OnceCell::new(),
            config,
        })
    }

    pub async fn adapter_for(&self, target: &AdapterTarget) -> Result<Arc<dyn Adapter>> {
        match target {
            AdapterTarget::Local => Ok(self.local.clone() as Arc<dyn Adapter>),
            AdapterTarget::Ssh(_) => Ok(self.ssh.clone() as Arc<dyn Adapter>),
            AdapterTarget::DockerPersistent { .. } | AdapterTarget::DockerEphemeral(_) => {
                let docker = self
                    .docker
                    .get_or_try_init(|| async { DockerAdapter::new(self.events.clone()).map(Arc::new) })
                    .await?;
                Ok(docker.clone() as Arc<dyn Adapter>)
            }
            AdapterTarget::Kubernetes(_) => {
                let k8s = self
                    .k8s
                    .get_or_try_init(|| async { KubernetesAdapter::new().await.map(Arc::new) })
                    .await?;
                Ok(k8s.clone() as Arc<dyn Adapter>)
            }
        }
    }

    /// Closes idle SSH connections; part of `Engine::dispose` (spec.md §5).
    pub async fn dispose(&self) {
        self.ssh.dispose_idle().await;
    }
}

/// Dispatches to the right adapter and launches one [`Command`] (spec.md
/// §4.3-§4.6). Does not wait for completion.
pub(crate) async fn launch(resources: &Resources, command: &Command) -> Result<Box<dyn RunningProcess>> {
    let adapter = resources.adapter_for(&command.target).await?;
    adapter.launch(command).await
}

/// Drives a launched process to its exit, applying the configured
/// timeout/kill-signal/grace-period escalation (spec.md §4.3 "Kill
/// discipline") and racing against cooperative cancellation (spec.md §5).
///
/// On timeout, returns `XecError::Timeout` after the process has been
/// signalled and, if it didn't exit within the grace period, SIGKILLed —
/// the caller never observes a lingering process (spec.md §8 "process is
/// reaped within the grace window; no zombie").
pub(crate) async fn wait_with_discipline(
    process: &mut dyn RunningProcess,
    command: &Command,
    cancel: &CancellationToken,
) -> Result<Exit> {
    let outcome = match command.timeout {
        Some(dur) => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Deadline::Cancelled),
                res = tokio::time::timeout(dur, process.wait()) => match res {
                    Ok(exit) => Ok(exit),
                    Err(_) => Err(Deadline::TimedOut),
                },
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Deadline::Cancelled),
                exit = process.wait() => Ok(exit),
            }
        }
    };

    match outcome {
        Ok(exit) => exit,
        Err(deadline) => {
            let _ = process.signal(&command.kill_signal).await;
            let escalated = tokio::time::timeout(command.kill_grace, process.wait()).await;
            if escalated.is_err() {
                let _ = process.signal("SIGKILL").await;
                let _ = process.wait().await;
            }
            let _ = process.dispose().await;
            match deadline {
                Deadline::TimedOut => Err(XecError::Timeout(command.timeout.unwrap_or(Duration::ZERO))),
                Deadline::Cancelled => Err(XecError::Cancelled),
            }
        }
    }
}

enum Deadline {
    TimedOut,
    Cancelled,
}

/// Reads a stream to completion, redacting at chunk boundaries and emitting
/// a `command:stdout`/`command:stderr` event per chunk unless `quiet`
/// (spec.md §4.10 "Redaction on the hot path", §4.2 `.quiet()`).
pub(crate) fn spawn_capture(
    reader: Option<BoxedRead>,
    redactor: Redactor,
    quiet: bool,
    events: EventBus,
    command_id: Uuid,
    adapter_kind: String,
    kind: EventKind,
) -> tokio::task::JoinHandle<String> {
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return String::new();
        };
        let mut buf = [0u8; 8192];
        let mut out = String::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let redacted = redactor.redact(&chunk);
                    if !quiet {
                        events.emit(command_id, &adapter_kind, kind.clone(), Payload::Chunk(redacted.clone().into_bytes()));
                    }
                    out.push_str(&redacted);
                }
            }
        }
        debug!(%command_id, bytes = out.len(), "stream captured");
        out
    })
}
