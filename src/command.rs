//! The `Command` record and the `AdapterTarget` it is dispatched against.
//!
//! Mirrors the shape of the teacher's `EnvironmentConfiguration`
//! (`environment/traits.rs`): a plain, cheaply cloned data record built by
//! the façade and consumed by whichever adapter ends up running it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Where standard input comes from.
#[derive(Debug, Clone)]
pub enum StdinSource {
    None,
    Inherit,
    Text(String),
    Bytes(Vec<u8>),
    /// Stdin is wired to another handle's stdout by [`crate::pipe`]; the
    /// adapter only needs to open the pipe, the bytes are fed in
    /// externally.
    Piped,
}

/// How a stream is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    Capture,
    Stream,
    Inherit,
    Ignore,
}

impl Default for StdioMode {
    fn default() -> Self {
        StdioMode::Capture
    }
}

/// SSH authentication method, tried in the order agent → key → password
/// (spec.md §4.4).
#[derive(Debug, Clone)]
pub enum SshAuth {
    Agent,
    PrivateKey { path: PathBuf, passphrase: Option<String> },
    Password(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostsPolicy {
    /// Refuse to connect to a host whose key isn't already known.
    Strict,
    /// Accept-and-record the first key seen for a host.
    AcceptNew,
    /// Never verify (explicitly opted into by the caller).
    Insecure,
}

impl Default for KnownHostsPolicy {
    fn default() -> Self {
        KnownHostsPolicy::Strict
    }
}

/// Options specific to an SSH target.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Vec<SshAuth>,
    pub known_hosts_path: Option<PathBuf>,
    pub known_hosts_policy: KnownHostsPolicy,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

/// Docker ephemeral-run specific options (spec.md §3, §4.5).
#[derive(Debug, Clone)]
pub struct DockerEphemeralOptions {
    pub image: String,
    /// Defaults to `true` (spec.md §3 "`auto-remove: true` by default";
    /// §6 `docker.autoRemove-default`).
    pub auto_remove: bool,
    pub volumes: Vec<(String, String, bool)>, // (host_or_volume, target, read_only)
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    pub entrypoint_override: Option<Vec<String>>,
    pub name: Option<String>,
}

impl Default for DockerEphemeralOptions {
    fn default() -> Self {
        Self {
            image: String::new(),
            auto_remove: true,
            volumes: Vec::new(),
            workdir: None,
            env: HashMap::new(),
            entrypoint_override: None,
            name: None,
        }
    }
}

/// Kubernetes exec options (spec.md §3, §4.6).
#[derive(Debug, Clone, Default)]
pub struct KubernetesOptions {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub tty: bool,
}

/// The substrate a [`Command`] is dispatched to.
#[derive(Debug, Clone)]
pub enum AdapterTarget {
    Local,
    Ssh(SshOptions),
    DockerPersistent { container: String },
    DockerEphemeral(DockerEphemeralOptions),
    Kubernetes(KubernetesOptions),
}

impl AdapterTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterTarget::Local => "local",
            AdapterTarget::Ssh(_) => "ssh",
            AdapterTarget::DockerPersistent { .. } => "docker:persistent",
            AdapterTarget::DockerEphemeral(_) => "docker:ephemeral",
            AdapterTarget::Kubernetes(_) => "kubernetes",
        }
    }
}

/// Either raw argv or a shell string, depending on whether `shell` is set.
#[derive(Debug, Clone)]
pub enum Invocation {
    Argv(Vec<String>),
    Shell(String),
}

/// Immutable record of everything an adapter needs to launch a process.
///
/// Built by [`crate::engine::Engine`] and [`crate::handle::ProcessHandle`],
/// consumed by `adapters::Adapter::launch`.
#[derive(Debug, Clone)]
pub struct Command {
    pub invocation: Invocation,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: StdinSource,
    pub stdout_mode: StdioMode,
    pub stderr_mode: StdioMode,
    /// `false` means argv is exec'd directly; `Some(path)` means the
    /// invocation is handed to `<path> -c <string>`.
    pub shell: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub kill_signal: String,
    pub kill_grace: Duration,
    pub raw: bool,
    pub interactive: bool,
    pub nothrow: bool,
    /// Suppresses `command:stdout`/`command:stderr` event emission for this
    /// run (spec.md §4.2 `.quiet()`); capture/streaming is unaffected.
    pub quiet: bool,
    /// Per-call cache opt-in (spec.md §4.10 "cache is opt-in per call or per
    /// engine"); `ctx.config.cache.enabled` is the per-engine opt-in, this
    /// is the per-call one — either is sufficient.
    pub cacheable: bool,
    pub target: AdapterTarget,
}

impl Command {
    /// The literal command string/argv joined for display and for cache
    /// key fingerprinting — never includes env/cwd/timeout.
    pub fn display_invocation(&self) -> String {
        match &self.invocation {
            Invocation::Argv(v) => v.join(" "),
            Invocation::Shell(s) => s.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.invocation {
            Invocation::Argv(v) => v.is_empty() || v.iter().all(|s| s.is_empty()),
            Invocation::Shell(s) => s.trim().is_empty(),
        }
    }
}
