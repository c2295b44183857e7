//! Per-key SSH connection pool (spec.md §4.4, §9 "Connection pool";
//! SPEC_FULL.md §14).
//!
//! Generalized from the teacher's `system::Locker` — a single mutual-
//! exclusion permit guarded by a `Semaphore` with `acquire_timeout` and a
//! guard-on-drop release — into an `N`-permit-per-key pool with a side idle
//! queue, plus a background reaper loop shaped like `cron::scheduler`'s
//! `tokio::spawn` interval loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::command::SshOptions;
use crate::error::{Result, XecError};
use crate::events::{EventBus, EventKind, Payload};

use super::adapter::ClientHandler;

pub type SshHandle = russh::client::Handle<ClientHandler>;

/// Identifies one pool partition: same host/port/user/auth-identity share
/// connections (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl PoolKey {
    pub fn from_options(opts: &SshOptions) -> Self {
        Self { host: opts.host.clone(), port: opts.port, user: opts.user.clone() }
    }
}

struct IdleConnection {
    handle: Arc<SshHandle>,
    idle_since: Instant,
}

struct KeyState {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
}

/// A pooled connection on loan. Dropping it without calling [`Self::release`]
/// still frees the semaphore permit (via the inner guard) but the
/// connection itself is discarded rather than returned to the idle queue —
/// callers that hit a broken pipe should simply drop the guard.
pub struct PooledConnection {
    pub handle: Arc<SshHandle>,
    key: PoolKey,
    pool: Arc<SshPoolInner>,
    _permit: tokio::sync::OwnedSemaphorePermit,
    returned: bool,
}

impl PooledConnection {
    /// Returns the connection to the idle queue for reuse.
    pub async fn release(mut self) {
        self.returned = true;
        self.pool.clone().return_idle(self.key.clone(), self.handle.clone()).await;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.returned {
            debug!("ssh connection dropped without release, discarding (not returned to pool)");
        }
    }
}

struct SshPoolInner {
    max_per_key: usize,
    idle_ttl: Duration,
    keys: DashMap<PoolKey, Arc<KeyState>>,
    events: EventBus,
}

impl SshPoolInner {
    async fn return_idle(self: Arc<Self>, key: PoolKey, handle: Arc<SshHandle>) {
        let state = self.key_state(&key);
        state.idle.lock().await.push(IdleConnection { handle, idle_since: Instant::now() });
        self.events.emit(
            uuid::Uuid::new_v4(),
            "ssh",
            EventKind::AdapterPoolRelease,
            Payload::Message(format!("{}:{}", key.host, key.port)),
        );
    }

    fn key_state(&self, key: &PoolKey) -> Arc<KeyState> {
        self.keys
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(KeyState {
                    permits: Arc::new(Semaphore::new(self.max_per_key)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }
}

/// Shared pool of SSH connections, one idle queue + FIFO waiter per key.
pub struct SshPool {
    inner: Arc<SshPoolInner>,
    acquire_timeout: Duration,
}

impl SshPool {
    pub fn new(max_per_key: usize, idle_ttl: Duration, acquire_timeout: Duration, events: EventBus) -> Self {
        let inner = Arc::new(SshPoolInner {
            max_per_key,
            idle_ttl,
            keys: DashMap::new(),
            events,
        });
        spawn_reaper(inner.clone());
        Self { inner, acquire_timeout }
    }

    /// Closes every idle connection across every key, used by
    /// `Engine::dispose` (spec.md §5 "closes all idle SSH connections").
    /// Connections currently on loan are left alone — they're released or
    /// discarded by their own [`PooledConnection::release`]/`Drop`.
    pub async fn dispose_idle(&self) {
        for entry in self.inner.keys.iter() {
            let mut idle = entry.value().idle.lock().await;
            for conn in idle.drain(..) {
                super::adapter::disconnect(conn.handle.as_ref()).await;
            }
        }
    }

    /// Acquires a connection for `key`, reusing an idle one if available or
    /// opening a fresh one via `connect` otherwise. Blocks (FIFO, via the
    /// per-key `Semaphore`) once `max_per_key` connections are in use, up to
    /// `acquire_timeout` before giving up with `Timeout` (spec.md §4.4
    /// "enqueues the caller FIFO until a connection frees or a per-acquire
    /// deadline elapses").
    pub async fn acquire<F, Fut>(&self, key: PoolKey, connect: F) -> Result<PooledConnection>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<SshHandle>>,
    {
        let state = self.inner.key_state(&key);
        let permit = match tokio::time::timeout(self.acquire_timeout, state.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(XecError::AdapterUnavailable("ssh pool closed".to_string())),
            Err(_) => return Err(XecError::Timeout(self.acquire_timeout)),
        };

        let handle = {
            let mut idle = state.idle.lock().await;
            idle.pop().map(|c| c.handle)
        };

        let handle = match handle {
            Some(h) => h,
            None => Arc::new(connect().await?),
        };

        self.inner.events.emit(
            uuid::Uuid::new_v4(),
            "ssh",
            EventKind::AdapterPoolAcquire,
            Payload::Message(format!("{}:{}", key.host, key.port)),
        );

        Ok(PooledConnection {
            handle,
            key,
            pool: self.inner.clone(),
            _permit: permit,
            returned: false,
        })
    }
}

fn spawn_reaper(inner: Arc<SshPoolInner>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            for entry in inner.keys.iter() {
                let key = entry.key().clone();
                let state = entry.value().clone();
                let mut idle = state.idle.lock().await;
                let before = idle.len();
                idle.retain(|c| c.idle_since.elapsed() < inner.idle_ttl);
                let reaped = before - idle.len();
                if reaped > 0 {
                    debug!(host = %key.host, reaped, "reaped idle ssh connections past ttl");
                    inner.events.emit(
                        uuid::Uuid::new_v4(),
                        "ssh",
                        EventKind::AdapterPoolReap,
                        Payload::Message(format!("{}:{} reaped={}", key.host, key.port, reaped)),
                    );
                }
            }
        }
    });
}
