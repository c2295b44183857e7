//! Pod exec adapter (spec.md §4.6).
//!
//! One `kube::Client` is shared across launches; each launch opens its own
//! exec channel (never shared, per spec.md §5 "Kubernetes exec channel:
//! per-handle; never shared"). Closing the channel is the substrate's only
//! way to interrupt a running command, so `signal`/`dispose` both abort the
//! background task that owns the `AttachedProcess` — the API server treats
//! that the same as a SIGKILL (spec.md §4.6).

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachedProcess, AttachParams};
use kube::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::adapters::{Adapter, BoxedRead, BoxedWrite, Exit, ExitSlot, RunningProcess};
use crate::command::{Command, Invocation, KubernetesOptions, StdinSource};
use crate::error::{Result, XecError};

pub struct KubernetesAdapter {
    client: Client,
}

impl KubernetesAdapter {
    /// Builds a client the way `kube::Client::try_default` does: from
    /// `KUBECONFIG`/in-cluster config, whichever is available (spec.md §6).
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| XecError::K8sUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn argv(command: &Command) -> Result<Vec<String>> {
        Ok(match (&command.shell, &command.invocation) {
            (Some(shell), Invocation::Shell(s)) => {
                vec![shell.to_string_lossy().into_owned(), "-c".to_string(), s.clone()]
            }
            (None, Invocation::Argv(argv)) => argv.clone(),
            (Some(shell), Invocation::Argv(argv)) => {
                vec![shell.to_string_lossy().into_owned(), "-c".to_string(), crate::escaping::join(argv)]
            }
            (None, Invocation::Shell(s)) => crate::escaping::split(s)
                .map_err(|e| XecError::Validation(format!("invalid raw command: {e}")))?,
        })
    }
}

#[async_trait::async_trait]
impl Adapter for KubernetesAdapter {
    async fn launch(&self, command: &Command) -> Result<Box<dyn RunningProcess>> {
        let crate::command::AdapterTarget::Kubernetes(opts) = &command.target else {
            return Err(XecError::Validation("kubernetes adapter received non-k8s target".to_string()));
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &opts.namespace);
        let argv = Self::argv(command)?;
        let has_stdin = matches!(command.stdin, StdinSource::Text(_) | StdinSource::Bytes(_) | StdinSource::Piped) || command.interactive;

        let mut params = AttachParams::default()
            .stdin(has_stdin)
            .stdout(true)
            .stderr(true)
            .tty(command.interactive);
        if let Some(container) = &opts.container {
            params = params.container(container.clone());
        }

        let mut attached = pods
            .exec(&opts.pod, argv, &params)
            .await
            .map_err(|e| classify(&opts.pod, e))?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let mut stdin = attached.stdin();

        match &command.stdin {
            StdinSource::Text(text) => {
                if let Some(sink) = &mut stdin {
                    let _ = sink.write_all(text.as_bytes()).await;
                }
            }
            StdinSource::Bytes(bytes) => {
                if let Some(sink) = &mut stdin {
                    let _ = sink.write_all(bytes).await;
                }
            }
            StdinSource::None | StdinSource::Inherit | StdinSource::Piped => {}
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let status_fut = attached.take_status();
        let join_handle = tokio::spawn(async move {
            // Keep `attached` alive until the channel tears down; dropping
            // it early closes the WebSocket underneath the take()n streams.
            let exit = match status_fut {
                Some(fut) => status_to_exit(fut.await),
                None => Exit::default(),
            };
            let _ = attached.join().await;
            let _ = exit_tx.send(exit);
        });

        Ok(Box::new(KubernetesProcess {
            stdout: stdout.map(|s| Box::pin(s) as BoxedRead),
            stderr: stderr.map(|s| Box::pin(s) as BoxedRead),
            stdin: stdin.map(|s| Box::pin(s) as BoxedWrite),
            exit: ExitSlot::new(exit_rx),
            abort: join_handle.abort_handle(),
        }))
    }
}

fn classify(pod: &str, error: kube::Error) -> XecError {
    match &error {
        kube::Error::Api(resp) if resp.code == 404 => XecError::PodNotFound(pod.to_string()),
        kube::Error::Api(resp) if resp.code == 403 => XecError::Forbidden(resp.message.clone()),
        _ => XecError::ExecFailed(error.to_string()),
    }
}

/// The exec subresource reports a non-zero exit as a `Failure` status with
/// reason `NonZeroExitCode` and the code in `details.causes` (spec.md §4.6
/// "Exit code is read from the channel's completion message").
fn status_to_exit(status: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>) -> Exit {
    let Some(status) = status else {
        return Exit::default();
    };
    if status.status.as_deref() == Some("Success") {
        return Exit { exit_code: Some(0), signal: None };
    }
    let code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
        .and_then(|c| c.message.as_ref())
        .and_then(|m| m.parse::<i32>().ok());
    Exit { exit_code: Some(code.unwrap_or(1)), signal: None }
}

struct KubernetesProcess {
    stdout: Option<BoxedRead>,
    stderr: Option<BoxedRead>,
    stdin: Option<BoxedWrite>,
    exit: ExitSlot,
    abort: AbortHandle,
}

#[async_trait::async_trait]
impl RunningProcess for KubernetesProcess {
    fn take_stdout(&mut self) -> Option<BoxedRead> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedRead> {
        self.stderr.take()
    }

    fn take_stdin(&mut self) -> Option<BoxedWrite> {
        self.stdin.take()
    }

    async fn wait(&mut self) -> Result<Exit> {
        self.exit.wait().await
    }

    /// There is no per-signal delivery over the exec subresource; any
    /// signal closes the channel outright (spec.md §4.6).
    async fn signal(&mut self, _signal: &str) -> Result<()> {
        self.abort.abort();
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.abort.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_maps_to_zero_exit() {
        let status = k8s_openapi::apimachinery::pkg::apis::meta::v1::Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(status_to_exit(Some(status)).exit_code, Some(0));
    }

    #[test]
    fn missing_status_defaults_to_none() {
        assert_eq!(status_to_exit(None).exit_code, None);
    }
}
