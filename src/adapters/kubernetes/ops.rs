//! Adjacent Kubernetes pod operations named in spec.md §4.6 that sit beside
//! `exec` rather than inside the `Adapter` trait: `logs`, `port-forward`,
//! `cp`. Mirrors the way the SSH adapter exposes `put`/`get` as operations
//! on a pooled connection without being part of command exec (spec.md §4.4).

use futures_util::AsyncWriteExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, LogParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, XecError};

/// `logs({follow, tail, since})` (spec.md §4.6).
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub container: Option<String>,
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
}

pub async fn logs(client: Client, namespace: &str, pod: &str, opts: LogOptions) -> Result<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let params = LogParams {
        container: opts.container,
        follow: opts.follow,
        tail_lines: opts.tail_lines,
        since_seconds: opts.since_seconds,
        ..Default::default()
    };
    pods.logs(pod, &params).await.map_err(|e| XecError::ExecFailed(e.to_string()))
}

/// A scoped port-forward: the local TCP listener and the upstream task are
/// torn down when this guard is dropped, on every exit path including
/// cancellation (spec.md §4.6 "returns a scoped acquisition with guaranteed
/// release on scope exit").
pub struct PortForwardGuard {
    local_port: u16,
    abort: tokio::task::AbortHandle,
}

impl PortForwardGuard {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for PortForwardGuard {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Opens a forwarded TCP listener on `local_port` (or an ephemeral one when
/// `0`) that proxies to `remote_port` on the pod.
pub async fn port_forward(
    client: Client,
    namespace: &str,
    pod: &str,
    local_port: u16,
    remote_port: u16,
) -> Result<PortForwardGuard> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", local_port))
        .await
        .map_err(XecError::Io)?;
    let bound_port = listener.local_addr().map_err(XecError::Io)?.port();

    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let pod_name = pod.to_string();

    let join = tokio::spawn(async move {
        loop {
            let Ok((mut inbound, _)) = listener.accept().await else {
                break;
            };
            let mut pods = pods.clone();
            let pod_name = pod_name.clone();
            tokio::spawn(async move {
                let Ok(mut forwarder) = pods.portforward(&pod_name, &[remote_port]).await else {
                    return;
                };
                let Some(mut upstream) = forwarder.take_stream(remote_port) else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(
                    &mut inbound,
                    &mut TokioCompat(&mut upstream),
                )
                .await;
                let _ = forwarder.join().await;
            });
        }
    });

    Ok(PortForwardGuard { local_port: bound_port, abort: join.abort_handle() })
}

/// Adapts a `futures::AsyncRead + AsyncWrite` stream (what `kube`'s
/// port-forward returns) to `tokio::io::{AsyncRead, AsyncWrite}` (what
/// `tokio::io::copy_bidirectional` expects) via `tokio_util::compat`.
struct TokioCompat<'a, S>(&'a mut S);

impl<'a, S: futures_util::AsyncRead + Unpin> AsyncRead for TokioCompat<'a, S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let mut tmp = vec![0u8; buf.remaining()];
        match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut tmp) {
            std::task::Poll::Ready(Ok(n)) => {
                buf.put_slice(&tmp[..n]);
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(Err(e)) => std::task::Poll::Ready(Err(e)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl<'a, S: futures_util::AsyncWrite + Unpin> AsyncWrite for TokioCompat<'a, S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_close(cx)
    }
}

/// `cp(from, to)` into a pod: streams a tar archive of `local_path` over a
/// `tar xf -` exec, the same trick `kubectl cp` itself uses since the API
/// has no dedicated copy endpoint.
pub async fn cp_to_pod(
    client: Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    local_path: &std::path::Path,
    remote_dir: &str,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let mut params = AttachParams::default().stdin(true).stdout(false).stderr(false);
    if let Some(c) = container {
        params = params.container(c.to_string());
    }
    let argv = vec!["tar".to_string(), "xf".to_string(), "-".to_string(), "-C".to_string(), remote_dir.to_string()];

    let mut attached = pods
        .exec(pod, argv, &params)
        .await
        .map_err(|e| XecError::ExecFailed(e.to_string()))?;
    let Some(mut stdin) = attached.stdin() else {
        return Err(XecError::ExecFailed("remote tar did not accept stdin".to_string()));
    };

    let tar_bytes = build_tar(local_path).await?;
    stdin.write_all(&tar_bytes).await.map_err(|e| XecError::ExecFailed(e.to_string()))?;
    drop(stdin);
    attached.join().await.map_err(|e| XecError::ExecFailed(e.to_string()))
}

async fn build_tar(path: &std::path::Path) -> Result<Vec<u8>> {
    let name = path
        .file_name()
        .ok_or_else(|| XecError::Validation("cp source has no file name".to_string()))?
        .to_string_lossy()
        .into_owned();
    let data = tokio::fs::read(path).await.map_err(XecError::Io)?;
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, &name, data.as_slice())
        .map_err(XecError::Io)?;
    builder.into_inner().map_err(XecError::Io)
}
