//! The immutable, chainable `Engine` façade (spec.md §4.2).
//!
//! Grounded on the "Immutable config with inheritance" design note (§9) and
//! the `Manager`/`HttpClient` pattern of holding configuration behind an
//! `Arc` and handing out cheap clones (`server/manager.rs`, `api/client.rs`)
//! — every chain method here returns a *new* `Engine` sharing the same
//! `Arc<Resources>` but carrying its own config/override layers, so the
//! original is never mutated (spec.md §8 "Immutability of engines").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::command::{
    AdapterTarget, Command, DockerEphemeralOptions, Invocation, KubernetesOptions, SshOptions,
    StdinSource, StdioMode,
};
use crate::config::{EngineConfig, PartialEngineConfig};
use crate::error::{Result, XecError};
use crate::escaping::{self, Template};
use crate::handle::ProcessHandle;
use crate::retry::RetryConfig;
use crate::runtime::Resources;

/// Selects Docker's ephemeral-run vs persistent-exec sub-mode (spec.md §4.2
/// "`$.docker(options)`"): ephemeral when an image is supplied, persistent
/// when a container is. The two are mutually exclusive at the type level so
/// a caller can't accidentally mix them.
#[derive(Debug, Clone)]
pub enum DockerTarget {
    Ephemeral(DockerEphemeralOptions),
    Persistent { container: String },
}

/// Per-chain overrides layered on top of [`EngineConfig`] (spec.md §4.2
/// "per-chain overrides"). Only the fields a caller actually touched are
/// `Some`/non-default; everything else falls through to the engine layer.
#[derive(Debug, Clone, Default)]
struct ChainOverrides {
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
    shell: Option<Option<PathBuf>>,
    retry: Option<RetryConfig>,
    raw: bool,
    quiet: bool,
    nothrow: bool,
    interactive: bool,
    cacheable: bool,
    target: Option<AdapterTarget>,
}

/// Immutable configuration carrier that produces [`ProcessHandle`]s
/// (spec.md §2 item 10, §4.2). Cheap to clone: configuration lives behind
/// `Arc`s, the shared adapters/event-bus/cache live behind one `Arc<Resources>`
/// for the lifetime of the root engine.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    overrides: ChainOverrides,
    resources: Arc<Resources>,
}

impl Engine {
    /// A fresh engine with process/engine defaults (§6) and `Local` as the
    /// default adapter target, env-seeded the way `Config::from_env` seeds
    /// the daemon's own settings (spec.md §6 "Environment variables
    /// observed").
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::from_env())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            resources: Arc::new(Resources::new(config.clone())?),
            config: Arc::new(config),
            overrides: ChainOverrides::default(),
        })
    }

    fn derive(&self, overrides: ChainOverrides) -> Self {
        Self { config: self.config.clone(), overrides, resources: self.resources.clone() }
    }

    // ---- chain configuration (spec.md §4.2) ----

    pub fn cwd(&self, path: impl Into<PathBuf>) -> Self {
        self.derive(ChainOverrides { cwd: Some(path.into()), ..self.overrides.clone() })
    }

    /// Merges `vars` into the environment layer; when `replace` is true the
    /// engine's accumulated env is cleared first instead of merged
    /// (spec.md §4.2 `env(map, {replace?})`).
    pub fn env(&self, vars: HashMap<String, String>, replace: bool) -> Self {
        let mut env = if replace { HashMap::new() } else { self.overrides.env.clone() };
        env.extend(vars);
        self.derive(ChainOverrides { env, ..self.overrides.clone() })
    }

    pub fn timeout(&self, millis: u64) -> Self {
        self.derive(ChainOverrides { timeout: Some(Duration::from_millis(millis)), ..self.overrides.clone() })
    }

    /// `false`/`None` execs argv directly; `Some(path)` hands the command to
    /// `<path> -c <string>` (spec.md §4.2 `.shell(pathOrFalse)`).
    pub fn shell(&self, path: Option<impl Into<PathBuf>>) -> Self {
        self.derive(ChainOverrides { shell: Some(path.map(Into::into)), ..self.overrides.clone() })
    }

    pub fn retry(&self, retry: RetryConfig) -> Self {
        self.derive(ChainOverrides { retry: Some(retry), ..self.overrides.clone() })
    }

    /// Switches subsequent template interpolation to raw (unescaped) mode.
    /// The returned engine remains fully chainable — this is the property
    /// tested by spec.md §8 "Chainability of raw": further `.cwd()`/
    /// `.timeout()`/… calls on the raw engine persist the `raw` flag.
    pub fn raw(&self) -> Self {
        self.derive(ChainOverrides { raw: true, ..self.overrides.clone() })
    }

    pub fn quiet(&self) -> Self {
        self.derive(ChainOverrides { quiet: true, ..self.overrides.clone() })
    }

    pub fn nothrow(&self) -> Self {
        self.derive(ChainOverrides { nothrow: true, ..self.overrides.clone() })
    }

    pub fn interactive(&self) -> Self {
        self.derive(ChainOverrides { interactive: true, ..self.overrides.clone() })
    }

    /// Opts this chain's commands into the result cache (spec.md §4.10
    /// "opt-in per call or per engine").
    pub fn cached(&self) -> Self {
        self.derive(ChainOverrides { cacheable: true, ..self.overrides.clone() })
    }

    /// Sets the *engine*-level configuration base layer (spec.md §9 Open
    /// Question, resolved in SPEC_FULL.md §20): `.defaults()` merges into
    /// the lowest layer, below any chain overrides already applied.
    pub fn defaults(&self, partial: PartialEngineConfig) -> Self {
        Self {
            config: Arc::new(self.config.merged_with(&partial)),
            overrides: self.overrides.clone(),
            resources: self.resources.clone(),
        }
    }

    /// Merges a partial config at the *chain* layer, on top of the engine
    /// defaults (SPEC_FULL.md §20's resolution of the `.with()`/`.defaults()`
    /// overlap).
    pub fn with(&self, partial: PartialEngineConfig) -> Self {
        let mut overrides = self.overrides.clone();
        if let Some(v) = partial.default_timeout {
            overrides.timeout = Some(v);
        }
        if let Some(v) = partial.default_shell {
            overrides.shell = Some(v);
        }
        overrides.env.extend(partial.default_env);
        if let Some(v) = partial.default_cwd {
            overrides.cwd = Some(v);
        }
        if let Some(v) = partial.throw_on_non_zero_exit {
            overrides.nothrow = !v;
        }
        if let Some(v) = partial.retry {
            overrides.retry = Some(v);
        }
        self.derive(overrides)
    }

    // ---- transport switchers (spec.md §2 item 10, §4.2) ----

    pub fn ssh(&self, options: SshOptions) -> Self {
        self.derive(ChainOverrides { target: Some(AdapterTarget::Ssh(options)), ..self.overrides.clone() })
    }

    pub fn docker(&self, target: DockerTarget) -> Self {
        let adapter_target = match target {
            DockerTarget::Ephemeral(mut opts) => {
                if opts.name.is_none() {
                    // Unique naming is mandatory for parallel ephemeral runs
                    // not to collide (spec.md §4.5, §8 scenario 6).
                    opts.name = Some(format!("xec-{}", uuid::Uuid::new_v4()));
                }
                AdapterTarget::DockerEphemeral(opts)
            }
            DockerTarget::Persistent { container } => AdapterTarget::DockerPersistent { container },
        };
        self.derive(ChainOverrides { target: Some(adapter_target), ..self.overrides.clone() })
    }

    pub fn k8s(&self, options: KubernetesOptions) -> Self {
        self.derive(ChainOverrides { target: Some(AdapterTarget::Kubernetes(options)), ..self.overrides.clone() })
    }

    // ---- building handles ----

    fn resolve_command(&self, invocation: Invocation) -> Result<Command> {
        if matches!(&invocation, Invocation::Argv(v) if v.is_empty() || v.iter().all(|s| s.is_empty()))
            || matches!(&invocation, Invocation::Shell(s) if s.trim().is_empty())
        {
            return Err(XecError::Validation("empty command".to_string()));
        }

        let mut env = self.config.default_env.clone();
        env.extend(self.overrides.env.clone());

        let cwd = self.overrides.cwd.clone().or_else(|| self.config.default_cwd.clone());
        let timeout = self.overrides.timeout.or(Some(self.config.default_timeout));
        let shell = self.overrides.shell.clone().unwrap_or_else(|| self.config.default_shell.clone());
        let nothrow = self.overrides.nothrow || !self.config.throw_on_non_zero_exit;
        let cacheable = self.overrides.cacheable || self.config.cache.enabled;
        let target = self.overrides.target.clone().unwrap_or(AdapterTarget::Local);

        if cacheable && self.overrides.interactive {
            return Err(XecError::Validation(
                "cache is not supported for interactive commands (spec.md §9 open question)".to_string(),
            ));
        }

        Ok(Command {
            invocation,
            cwd,
            env,
            stdin: StdinSource::None,
            stdout_mode: StdioMode::Capture,
            stderr_mode: StdioMode::Capture,
            shell,
            timeout,
            kill_signal: self.config.kill.signal.clone(),
            kill_grace: self.config.kill.grace,
            raw: self.overrides.raw,
            interactive: self.overrides.interactive,
            nothrow,
            quiet: self.overrides.quiet,
            cacheable,
            target,
        })
    }

    fn retry_config(&self) -> RetryConfig {
        self.overrides.retry.clone().unwrap_or_else(|| self.config.retry.clone())
    }

    /// Runs a pre-built [`Template`] (spec.md §4.1): shell strings are
    /// handed to `<shell> -c`, argv-mode splits the rendered string the same
    /// way a POSIX shell would (spec.md §4.1 "raw mode").
    pub fn run(&self, template: Template) -> Result<ProcessHandle> {
        let rendered = template.build();
        let invocation = match &self.overrides.shell.clone().unwrap_or_else(|| self.config.default_shell.clone()) {
            Some(_) => Invocation::Shell(rendered),
            None => Invocation::Argv(
                escaping::split(&rendered)
                    .map_err(|e| XecError::Validation(format!("cannot tokenize raw command: {e}")))?,
            ),
        };
        let command = self.resolve_command(invocation)?;
        Ok(ProcessHandle::new(command, self.retry_config(), self.resources.clone()))
    }

    /// Runs a literal argv, bypassing shell quoting entirely — always exec'd
    /// directly regardless of `.shell()` (spec.md §3 `Invocation::Argv`).
    pub fn argv<I, S>(&self, args: I) -> Result<ProcessHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut command = self.resolve_command(Invocation::Argv(argv))?;
        command.shell = None;
        Ok(ProcessHandle::new(command, self.retry_config(), self.resources.clone()))
    }

    /// Runs a literal shell string, forcing shell mode even if `.shell(None)`
    /// was set on this engine.
    pub fn sh(&self, command: impl Into<String>) -> Result<ProcessHandle> {
        let mut built = self.resolve_command(Invocation::Shell(command.into()))?;
        if built.shell.is_none() {
            built.shell = Some(PathBuf::from("sh"));
        }
        Ok(ProcessHandle::new(built, self.retry_config(), self.resources.clone()))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<crate::events::Event> {
        self.resources.events.subscribe()
    }

    /// Closes all idle SSH connections and drains the event bus (spec.md §5
    /// "scoped `dispose()`"). Ephemeral Docker containers are owned by their
    /// handles, not the engine, and are removed by those handles' own
    /// `dispose` paths.
    pub async fn dispose(&self) {
        self.resources.dispose().await;
    }

    /// Uploads `local_path` to `remote_path` on `options.host` over a pooled
    /// SSH connection. An adjacent operation to command exec, not part of it
    /// (spec.md §4.4) — unaffected by `.cwd()`/`.env()`/`.timeout()` and any
    /// other command-shaped chain overrides.
    pub async fn put(&self, options: &SshOptions, local_path: &Path, remote_path: &str) -> Result<()> {
        crate::adapters::ssh::put(&self.resources.ssh, options, local_path, remote_path).await
    }

    /// Downloads `remote_path` on `options.host` to `local_path` over a
    /// pooled SSH connection (spec.md §4.4).
    pub async fn get(&self, options: &SshOptions, remote_path: &str, local_path: &Path) -> Result<()> {
        crate::adapters::ssh::get(&self.resources.ssh, options, remote_path, local_path).await
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new().expect("default engine configuration never fails to construct")
    }
}

/// Quotes a single path-like fragment for inclusion in a raw template
/// literal — a small convenience re-export so callers building `Template`s
/// don't need a separate import for the common "append a path" case.
pub fn quote_path(path: &Path) -> String {
    escaping::quote(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_returns_a_new_engine_leaving_the_original_untouched() {
        let e = Engine::new().unwrap();
        let e2 = e.timeout(5000);
        assert_eq!(e.overrides.timeout, None);
        assert_eq!(e2.overrides.timeout, Some(Duration::from_millis(5000)));
    }

    #[test]
    fn raw_stays_chainable() {
        let e = Engine::new().unwrap().raw().cwd("/tmp").timeout(1000);
        assert!(e.overrides.raw);
        assert_eq!(e.overrides.cwd, Some(PathBuf::from("/tmp")));
    }

    #[test]
    fn docker_ephemeral_gets_a_unique_name_when_unspecified() {
        let e = Engine::new().unwrap();
        let e1 = e.docker(DockerTarget::Ephemeral(DockerEphemeralOptions {
            image: "alpine".to_string(),
            ..Default::default()
        }));
        let e2 = e.docker(DockerTarget::Ephemeral(DockerEphemeralOptions {
            image: "alpine".to_string(),
            ..Default::default()
        }));
        let (AdapterTarget::DockerEphemeral(o1), AdapterTarget::DockerEphemeral(o2)) =
            (e1.overrides.target.unwrap(), e2.overrides.target.unwrap())
        else {
            panic!("expected docker ephemeral targets");
        };
        assert_ne!(o1.name, o2.name);
    }

    #[test]
    fn empty_command_is_a_validation_error() {
        let e = Engine::new().unwrap();
        assert!(matches!(e.argv(Vec::<String>::new()), Err(XecError::Validation(_))));
    }

    #[test]
    fn cache_and_interactive_are_mutually_exclusive() {
        let e = Engine::new().unwrap().cached().interactive();
        assert!(matches!(e.argv(vec!["echo", "hi"]), Err(XecError::Validation(_))));
    }
}
