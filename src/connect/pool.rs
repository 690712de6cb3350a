//! Connection pool: reuse, coalescing lookup, idle eviction, and leak
//! detection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::call::RealCall;
use crate::endpoint::Endpoint;
use crate::route::Route;

use super::connection::RealConnection;

/// Shared store of live connections.
///
/// Connections are added after handshake, handed out to eligible calls,
/// and evicted by a background cleanup task once idle too long or too
/// numerous. The cleanup pass also sweeps each connection's weak call
/// references: a collected referent means a response body was never
/// closed.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_idle_connections: usize,
    keep_alive: Duration,
    connections: Mutex<VecDeque<Arc<RealConnection>>>,
    cleanup_wakeup: tokio::sync::Notify,
    cleanup_running: AtomicBool,
}

impl ConnectionPool {
    /// Defaults: at most 5 idle connections, kept alive 5 minutes.
    pub fn new() -> Self {
        Self::with_tunables(5, Duration::from_secs(5 * 60))
    }

    pub fn with_tunables(max_idle_connections: usize, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_idle_connections,
                keep_alive,
                connections: Mutex::new(VecDeque::new()),
                cleanup_wakeup: tokio::sync::Notify::new(),
                cleanup_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock_connections().len()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .lock_connections()
            .iter()
            .filter(|c| c.active_call_count() == 0)
            .count()
    }

    /// Add a freshly connected connection and (re)arm the cleanup task.
    pub fn put(&self, connection: Arc<RealConnection>) {
        self.inner.lock_connections().push_back(connection);
        self.schedule_cleanup();
    }

    /// Try to attach `call` to a pooled connection for `endpoint`.
    ///
    /// `routes` enables HTTP/2 coalescing across hostnames sharing an
    /// address; `require_multiplexed` restricts the scan to HTTP/2
    /// connections (used for the post-handshake race).
    pub fn call_acquire_pooled_connection(
        &self,
        endpoint: &Endpoint,
        call: &Arc<RealCall>,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
    ) -> Option<Arc<RealConnection>> {
        let connections = self.inner.lock_connections();
        for connection in connections.iter() {
            if require_multiplexed && !connection.is_multiplexed() {
                continue;
            }
            if !connection.is_eligible(endpoint, routes) {
                continue;
            }
            connection.attach_call(call);
            tracing::debug!(
                connection = connection.id(),
                host = endpoint.host(),
                "reusing pooled connection"
            );
            return Some(Arc::clone(connection));
        }
        None
    }

    /// A connection's last call detached. Returns true when the pool
    /// keeps it for reuse; false means the caller must close it.
    pub fn connection_became_idle(&self, connection: &Arc<RealConnection>) -> bool {
        if connection.is_no_new_exchanges() || self.inner.max_idle_connections == 0 {
            let mut connections = self.inner.lock_connections();
            connections.retain(|c| !Arc::ptr_eq(c, connection));
            false
        } else {
            connection.set_idle_at(Instant::now());
            self.schedule_cleanup();
            true
        }
    }

    /// Close every connection not currently carrying a call.
    pub fn evict_all(&self) {
        let evicted: Vec<Arc<RealConnection>> = {
            let mut connections = self.inner.lock_connections();
            let (idle, busy): (Vec<_>, Vec<_>) = connections
                .drain(..)
                .partition(|c| c.active_call_count() == 0);
            *connections = busy.into();
            idle
        };
        for connection in evicted {
            drop(connection.take_transport());
        }
    }

    /// One cleanup pass at `now`. Returns how long to sleep before the
    /// next pass, or None when the pool is empty and the task can park.
    pub fn cleanup(&self, now: Instant) -> Option<Duration> {
        let keep_alive = self.inner.keep_alive;
        let mut in_use_count = 0usize;
        let mut idle_count = 0usize;
        let mut longest_idle: Option<(Duration, usize)> = None;

        let to_evict: Option<Arc<RealConnection>> = {
            let mut connections = self.inner.lock_connections();
            if connections.is_empty() {
                return None;
            }
            for (index, connection) in connections.iter().enumerate() {
                if prune_leaked_calls(connection) > 0 && connection.active_call_count() == 0 {
                    // Every reference leaked: age the connection so this
                    // pass (or the next) evicts it.
                    connection.set_idle_at(now.checked_sub(keep_alive).unwrap_or(now));
                }
                if connection.active_call_count() > 0 {
                    in_use_count += 1;
                    continue;
                }
                idle_count += 1;
                let idle_for = now.saturating_duration_since(connection.idle_at());
                if longest_idle.map_or(true, |(longest, _)| idle_for > longest) {
                    longest_idle = Some((idle_for, index));
                }
            }

            match longest_idle {
                Some((idle_for, index))
                    if idle_for >= keep_alive || idle_count > self.inner.max_idle_connections =>
                {
                    connections.remove(index)
                }
                _ => None,
            }
        };

        if let Some(connection) = to_evict {
            tracing::debug!(connection = connection.id(), "evicting idle connection");
            // Close outside the lock.
            drop(connection.take_transport());
            return Some(Duration::ZERO);
        }

        if let Some((longest, _)) = longest_idle {
            Some(keep_alive - longest)
        } else if in_use_count > 0 {
            Some(keep_alive)
        } else {
            None
        }
    }

    fn schedule_cleanup(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime: callers drive cleanup() directly.
            return;
        };
        if self
            .inner
            .cleanup_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            let pool = ConnectionPool { inner };
            handle.spawn(async move {
                loop {
                    match pool.cleanup(Instant::now()) {
                        Some(Duration::ZERO) => continue,
                        Some(wait) => {
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = pool.inner.cleanup_wakeup.notified() => {}
                            }
                        }
                        None => pool.inner.cleanup_wakeup.notified().await,
                    }
                }
            });
        } else {
            self.inner.cleanup_wakeup.notify_one();
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .field("idle", &self.idle_connection_count())
            .finish()
    }
}

impl PoolInner {
    fn lock_connections(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<RealConnection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drop call references whose referent was collected without detaching,
/// logging where each leaked body was acquired. Returns how many leaked.
fn prune_leaked_calls(connection: &RealConnection) -> usize {
    let mut leaked = Vec::new();
    {
        let mut state = connection.lock_state();
        state.calls.retain(|reference| {
            if reference.call.strong_count() > 0 {
                true
            } else {
                leaked.push(reference.acquired_for.clone());
                false
            }
        });
    }
    for acquired_for in &leaked {
        tracing::warn!(
            connection = connection.id(),
            request = %acquired_for,
            "connection leaked: response body was never closed"
        );
    }
    leaked.len()
}
