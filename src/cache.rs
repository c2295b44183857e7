//! Content-addressed, TTL- and size-bounded result cache with single-flight
//! coalescing (spec.md §3, §4.10).
//!
//! The registry shape is lifted straight from the teacher's
//! `server::Manager` (`DashMap<String, Arc<Server>>`); the fingerprint uses
//! `sha2`, already pulled in by the teacher for backup checksums.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::Shared;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::command::{AdapterTarget, Command};
use crate::error::XecError;
use crate::result::ExecutionResult;

pub type CacheKey = String;

/// Semantic fields of a [`Command`] + [`AdapterTarget`] that participate in
/// the cache key — deliberately excludes transient fields like `timeout`
/// (spec.md §3).
pub fn fingerprint(command: &Command) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(command.display_invocation().as_bytes());
    if let Some(cwd) = &command.cwd {
        hasher.update(cwd.to_string_lossy().as_bytes());
    }
    let mut env_keys: Vec<_> = command.env.iter().collect();
    env_keys.sort_by_key(|(k, _)| k.clone());
    for (k, v) in env_keys {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    if let Some(shell) = &command.shell {
        hasher.update(shell.to_string_lossy().as_bytes());
    }
    hasher.update(command.target.kind().as_bytes());
    match &command.target {
        AdapterTarget::Ssh(opts) => {
            hasher.update(opts.host.as_bytes());
            hasher.update(opts.port.to_string().as_bytes());
            hasher.update(opts.user.as_bytes());
        }
        AdapterTarget::DockerPersistent { container } => hasher.update(container.as_bytes()),
        AdapterTarget::DockerEphemeral(opts) => hasher.update(opts.image.as_bytes()),
        AdapterTarget::Kubernetes(opts) => {
            hasher.update(opts.namespace.as_bytes());
            hasher.update(opts.pod.as_bytes());
        }
        AdapterTarget::Local => {}
    }
    format!("{:x}", hasher.finalize())
}

type InFlight = Shared<futures::future::BoxFuture<'static, Result<ExecutionResult, XecError>>>;

struct Entry {
    value: ExecutionResult,
    created_at: Instant,
    ttl: Duration,
    size_bytes: usize,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// In-memory result cache: TTL + total byte budget, LRU-ish eviction among
/// expired-or-idle entries first, single-flight per key.
pub struct ResultCache {
    entries: DashMap<CacheKey, Entry>,
    in_flight: AsyncMutex<std::collections::HashMap<CacheKey, InFlight>>,
    max_bytes: usize,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: AsyncMutex::new(std::collections::HashMap::new()),
            max_bytes,
            default_ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<ExecutionResult> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn total_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    fn evict_to_fit(&self, incoming: usize) {
        if self.total_bytes() + incoming <= self.max_bytes {
            return;
        }
        // Expired entries first, then oldest-created among the rest.
        let mut candidates: Vec<(CacheKey, bool, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.is_expired(), e.created_at))
            .collect();
        candidates.sort_by(|a, b| match (a.1, b.1) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.2.cmp(&b.2),
        });
        for (key, _, _) in candidates {
            if self.total_bytes() + incoming <= self.max_bytes {
                break;
            }
            self.entries.remove(&key);
        }
    }

    pub fn insert(&self, key: CacheKey, value: ExecutionResult, ttl: Option<Duration>) {
        let size_bytes = value.stdout.len() + value.stderr.len() + value.combined.len();
        self.evict_to_fit(size_bytes);
        self.entries.insert(
            key,
            Entry {
                value,
                created_at: Instant::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
                size_bytes,
            },
        );
    }

    /// Runs `compute` to produce a result for `key`, coalescing concurrent
    /// callers for the same key into a single underlying execution
    /// (spec.md §8 "Single-flight cache").
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<ExecutionResult, XecError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ExecutionResult, XecError>> + Send + 'static,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }

        let shared = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                existing.clone()
            } else {
                let fut: futures::future::BoxFuture<'static, Result<ExecutionResult, XecError>> =
                    Box::pin(compute());
                let shared = fut.shared();
                in_flight.insert(key.clone(), shared.clone());
                shared
            }
        };

        let outcome = shared.await;
        self.in_flight.lock().await.remove(&key);

        match outcome {
            Ok(result) => {
                self.insert(key, result.clone(), ttl);
                Ok(result)
            }
            Err(err) => Err(err),
        }
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn result(stdout: &str) -> ExecutionResult {
        let now = chrono::Utc::now();
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            combined: stdout.to_string(),
            exit_code: Some(0),
            signal: None,
            duration_ms: 0,
            started_at: now,
            finished_at: now,
            command: "echo hi".to_string(),
            adapter_kind: "local".to_string(),
            piped_from: None,
        }
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_callers() {
        let cache = Arc::new(ResultCache::new(1024, Duration::from_secs(60)));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_string(), None, || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(result("same"))
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            let r = h.await.unwrap();
            assert_eq!(r.stdout, "same");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compute_error_surfaces_with_its_original_variant_and_payload() {
        let cache = ResultCache::new(1024, Duration::from_secs(60));
        let err = cache
            .get_or_compute("k".to_string(), None, || async {
                Err(XecError::Command(Box::new(result("exit 3"))))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, XecError::Command(r) if r.stdout == "exit 3"));
    }

    #[test]
    fn fingerprint_ignores_timeout_like_transient_fields() {
        use crate::command::{AdapterTarget, Invocation, StdinSource, StdioMode};
        let base = Command {
            invocation: Invocation::Shell("echo hi".to_string()),
            cwd: None,
            env: Default::default(),
            stdin: StdinSource::None,
            stdout_mode: StdioMode::Capture,
            stderr_mode: StdioMode::Capture,
            shell: Some("/bin/sh".into()),
            timeout: Some(Duration::from_millis(1)),
            kill_signal: "SIGTERM".to_string(),
            kill_grace: Duration::from_secs(5),
            raw: false,
            interactive: false,
            nothrow: false,
            quiet: false,
            cacheable: false,
            target: AdapterTarget::Local,
        };
        let mut other = base.clone();
        other.timeout = Some(Duration::from_secs(99));
        assert_eq!(fingerprint(&base), fingerprint(&other));
    }

    #[test]
    fn fingerprint_differs_on_invocation() {
        use crate::command::{AdapterTarget, Invocation, StdinSource, StdioMode};
        let a = Command {
            invocation: Invocation::Shell("echo a".to_string()),
            cwd: None,
            env: Default::default(),
            stdin: StdinSource::None,
            stdout_mode: StdioMode::Capture,
            stderr_mode: StdioMode::Capture,
            shell: None,
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
        let mut b = a.clone();
        b.invocation = Invocation::Shell("echo b".to_string());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
