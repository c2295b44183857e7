//! Crate-wide error taxonomy.
//!
//! Every adapter has its own narrower error enum (see
//! `adapters::ssh::SshError`, `adapters::docker::DockerAdapterError`,
//! `adapters::kubernetes::K8sError`) that converts into [`XecError`] via
//! `#[from]`, the same way the teacher's `EnvironmentError` fed into
//! `DaemonError`.

use thiserror::Error;

use crate::result::ExecutionResult;

/// The full error taxonomy described in spec.md §7.
#[derive(Debug, Error)]
pub enum XecError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("command exited with a non-zero status")]
    Command(Box<ExecutionResult>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("template interpolation error: {0}")]
    InvalidArgument(String),

    // --- SSH specifics ---
    #[error("SSH authentication failed: {0}")]
    AuthFailure(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("SSH handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("failed to open exec channel: {0}")]
    ChannelOpenFailure(String),

    #[error("remote command exited non-zero: {0}")]
    RemoteExitNonZero(i32),

    // --- Docker specifics ---
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container is not running: {0}")]
    ContainerNotRunning(String),

    #[error("failed to create exec instance: {0}")]
    ExecCreateFailed(String),

    #[error("failed to pull image: {0}")]
    ImagePullFailed(String),

    #[error("docker daemon unavailable: {0}")]
    DockerUnavailable(String),

    // --- Kubernetes specifics ---
    #[error("pod not found: {0}")]
    PodNotFound(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("kubernetes API unavailable: {0}")]
    K8sUnavailable(String),
}

impl XecError {
    /// Errors that `retry` must never retry past, per spec.md §7.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            XecError::Validation(_) | XecError::InvalidState(_) | XecError::Cancelled
        )
    }

    /// The [`ExecutionResult`] carried by a `CommandError`-equivalent, if any.
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            XecError::Command(r) => Some(r),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, XecError>;

/// Hand-written because `std::io::Error` isn't `Clone`; reconstructed from
/// its kind and message instead. Needed so a [`crate::handle::ProcessHandle`]
/// can share one launch's terminal outcome across every awaiter, including
/// the error path (spec.md §4.7 "re-awaiting yields the same terminal
/// result").
impl Clone for XecError {
    fn clone(&self) -> Self {
        match self {
            XecError::Validation(s) => XecError::Validation(s.clone()),
            XecError::InvalidState(s) => XecError::InvalidState(s.clone()),
            XecError::AdapterUnavailable(s) => XecError::AdapterUnavailable(s.clone()),
            XecError::Timeout(d) => XecError::Timeout(*d),
            XecError::Cancelled => XecError::Cancelled,
            XecError::Command(r) => XecError::Command(r.clone()),
            XecError::Io(e) => XecError::Io(std::io::Error::new(e.kind(), e.to_string())),
            XecError::InvalidArgument(s) => XecError::InvalidArgument(s.clone()),
            XecError::AuthFailure(s) => XecError::AuthFailure(s.clone()),
            XecError::HostUnreachable(s) => XecError::HostUnreachable(s.clone()),
            XecError::HandshakeFailure(s) => XecError::HandshakeFailure(s.clone()),
            XecError::ChannelOpenFailure(s) => XecError::ChannelOpenFailure(s.clone()),
            XecError::RemoteExitNonZero(n) => XecError::RemoteExitNonZero(*n),
            XecError::ContainerNotFound(s) => XecError::ContainerNotFound(s.clone()),
            XecError::ContainerNotRunning(s) => XecError::ContainerNotRunning(s.clone()),
            XecError::ExecCreateFailed(s) => XecError::ExecCreateFailed(s.clone()),
            XecError::ImagePullFailed(s) => XecError::ImagePullFailed(s.clone()),
            XecError::DockerUnavailable(s) => XecError::DockerUnavailable(s.clone()),
            XecError::PodNotFound(s) => XecError::PodNotFound(s.clone()),
            XecError::ExecFailed(s) => XecError::ExecFailed(s.clone()),
            XecError::Forbidden(s) => XecError::Forbidden(s.clone()),
            XecError::K8sUnavailable(s) => XecError::K8sUnavailable(s.clone()),
        }
    }
}
