//! xec-core: a universal command-execution façade over local processes,
//! SSH, Docker, and Kubernetes (spec.md §1-§2).
//!
//! Commands are built through [`Engine`], producing [`ProcessHandle`]s that
//! are launched lazily on first `.await`/`.run()` and cache their terminal
//! [`ExecutionResult`] for every later awaiter. Handles chain into
//! [`Pipeline`]s (shell-style `|`) and fan out through [`parallel`]'s
//! coordinators.

pub mod adapters;
pub mod cache;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod escaping;
pub mod events;
pub mod handle;
pub mod parallel;
pub mod pipe;
pub mod redact;
pub mod result;
pub mod retry;
mod runtime;

pub use command::{AdapterTarget, Command, DockerEphemeralOptions, KubernetesOptions, SshAuth, SshOptions};
pub use engine::{DockerTarget, Engine};
pub use error::{Result, XecError};
pub use escaping::Template;
pub use events::{Event, EventKind};
pub use handle::{HandleState, ProcessHandle};
pub use pipe::Pipeline;
pub use result::{Cause, ExecutionResult};
pub use retry::RetryConfig;
