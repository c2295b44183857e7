//! The engine-level configuration surface enumerated in spec.md §6.
//!
//! Grounded on the teacher's `config::Configuration` (nested, per-field
//! `#[serde(default = ...)]` structs loaded from a file) and `Config::from_env`
//! (plain env var overrides) — this crate owns the struct and its defaults
//! but not a file loader: spec.md §1 names the config-file loader as an
//! external collaborator.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

fn default_timeout() -> Duration {
    Duration::from_millis(120_000)
}

fn default_kill_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_grace() -> Duration {
    Duration::from_millis(5_000)
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

/// `kill.signal` / `kill.grace-ms` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillConfig {
    #[serde(default = "default_kill_signal")]
    pub signal: String,
    #[serde(default = "default_kill_grace", with = "duration_millis")]
    pub grace: Duration,
}

impl Default for KillConfig {
    fn default() -> Self {
        Self { signal: default_kill_signal(), grace: default_kill_grace() }
    }
}

/// `cache.enabled` / `cache.ttl-ms` / `cache.max-bytes` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl", with = "duration_millis")]
    pub ttl: Duration,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: false, ttl: default_cache_ttl(), max_bytes: default_cache_max_bytes() }
    }
}

/// `ssh.pool.*` (spec.md §6, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshPoolConfig {
    #[serde(default = "default_ssh_pool_max")]
    pub max_per_key: usize,
    #[serde(default = "default_ssh_pool_idle_ttl", with = "duration_millis")]
    pub idle_ttl: Duration,
    #[serde(default = "default_ssh_pool_keepalive", with = "duration_millis")]
    pub keepalive: Duration,
    #[serde(default = "default_connect_timeout", with = "duration_millis")]
    pub connect_timeout: Duration,
    /// How long a caller waits for a free permit before the pool gives up
    /// with `Timeout` (spec.md §4.4 "enqueues the caller FIFO until a
    /// connection frees or a per-acquire deadline elapses").
    #[serde(default = "default_acquire_timeout", with = "duration_millis")]
    pub acquire_timeout: Duration,
}

fn default_ssh_pool_max() -> usize {
    4
}
fn default_ssh_pool_idle_ttl() -> Duration {
    Duration::from_secs(300)
}
fn default_ssh_pool_keepalive() -> Duration {
    Duration::from_secs(30)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SshPoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: default_ssh_pool_max(),
            idle_ttl: default_ssh_pool_idle_ttl(),
            keepalive: default_ssh_pool_keepalive(),
            connect_timeout: default_connect_timeout(),
            acquire_timeout: default_acquire_timeout(),
        }
    }
}

/// Engine-wide defaults, the lowest configuration layer (spec.md §4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_timeout", with = "duration_millis")]
    pub default_timeout: Duration,
    /// `None` means argv is exec'd directly; `Some(path)` runs `<path> -c`.
    #[serde(default = "default_shell")]
    pub default_shell: Option<PathBuf>,
    #[serde(default)]
    pub default_env: HashMap<String, String>,
    #[serde(default)]
    pub default_cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub throw_on_non_zero_exit: bool,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    #[serde(default)]
    pub kill: KillConfig,
    #[serde(default)]
    pub redact_patterns: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ssh_pool: SshPoolConfig,
    #[serde(default = "default_true")]
    pub docker_auto_remove_default: bool,
    #[serde(default = "default_true")]
    pub events_enabled: bool,
    #[serde(skip, default)]
    pub retry: RetryConfig,
}

fn default_shell() -> Option<PathBuf> {
    Some(PathBuf::from("sh"))
}
fn default_true() -> bool {
    true
}
fn default_max_buffer() -> usize {
    10 * 1024 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            default_shell: default_shell(),
            default_env: HashMap::new(),
            default_cwd: None,
            throw_on_non_zero_exit: true,
            encoding: default_encoding(),
            max_buffer: default_max_buffer(),
            kill: KillConfig::default(),
            redact_patterns: Vec::new(),
            cache: CacheConfig::default(),
            ssh_pool: SshPoolConfig::default(),
            docker_auto_remove_default: true,
            events_enabled: true,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Environment variables observed by the engine (spec.md §6): this does
    /// not read a config *file* (that's the external collaborator's job),
    /// it only seeds the handful of fields the process environment itself
    /// governs, the way `Config::from_env` did for the daemon's own
    /// host/port.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(home) = std::env::var("HOME") {
            cfg.default_env.entry("HOME".to_string()).or_insert(home);
        }
        if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
            cfg.default_env.entry("SSH_AUTH_SOCK".to_string()).or_insert(sock);
        }
        if let Ok(host) = std::env::var("DOCKER_HOST") {
            cfg.default_env.entry("DOCKER_HOST".to_string()).or_insert(host);
        }
        if let Ok(kubeconfig) = std::env::var("KUBECONFIG") {
            cfg.default_env.entry("KUBECONFIG".to_string()).or_insert(kubeconfig);
        }
        cfg
    }

    /// Merges `other` on top of `self`, used by `Engine::with`/`.defaults()`
    /// to layer configuration (spec.md §4.2).
    pub fn merged_with(&self, other: &PartialEngineConfig) -> Self {
        let mut merged = self.clone();
        if let Some(v) = other.default_timeout {
            merged.default_timeout = v;
        }
        if let Some(v) = &other.default_shell {
            merged.default_shell = v.clone();
        }
        for (k, v) in &other.default_env {
            merged.default_env.insert(k.clone(), v.clone());
        }
        if let Some(v) = &other.default_cwd {
            merged.default_cwd = Some(v.clone());
        }
        if let Some(v) = other.throw_on_non_zero_exit {
            merged.throw_on_non_zero_exit = v;
        }
        if let Some(v) = &other.retry {
            merged.retry = v.clone();
        }
        merged
    }
}

/// A sparse overlay applied at the chain or handle layer (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct PartialEngineConfig {
    pub default_timeout: Option<Duration>,
    pub default_shell: Option<Option<PathBuf>>,
    pub default_env: HashMap<String, String>,
    pub default_cwd: Option<PathBuf>,
    pub throw_on_non_zero_exit: Option<bool>,
    pub retry: Option<RetryConfig>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.default_timeout, Duration::from_millis(120_000));
        assert_eq!(cfg.kill.signal, "SIGTERM");
        assert_eq!(cfg.kill.grace, Duration::from_millis(5_000));
        assert!(cfg.throw_on_non_zero_exit);
        assert!(cfg.docker_auto_remove_default);
    }

    #[test]
    fn merge_overlays_only_set_fields() {
        let base = EngineConfig::default();
        let overlay = PartialEngineConfig {
            default_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.default_timeout, Duration::from_secs(1));
        assert_eq!(merged.kill.signal, base.kill.signal);
    }
}
