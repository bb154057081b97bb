//! Per-host connection pool.
//!
//! A pool keeps `core_connections_per_host` connections open, grows up to
//! `max_connections_per_host` under load, and replaces lost connections with
//! exponential backoff. Requests that find every stream busy park in a
//! bounded waiter set until a connection frees up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cluster::host::Host;
use crate::connection::Connection;
use crate::constant::ProtocolVersion;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::opts::Opts;

/// Consecutive connect failures after which the pool stops retrying until an
/// external event kicks it.
const CRITICAL_FAILURE_THRESHOLD: usize = 3;

pub(crate) struct Pool {
    pub host: Arc<Host>,
    opts: Arc<Opts>,
    version: ProtocolVersion,
    /// Session-wide keyspace, read when opening new connections.
    session_keyspace: Arc<RwLock<Option<String>>>,
    connections: RwLock<Vec<Arc<Connection>>>,
    ready_notify: Notify,
    maintain_notify: Notify,
    waiters: AtomicUsize,
    want_grow: AtomicBool,
    is_closing: AtomicBool,
    is_critical_failure: AtomicBool,
    consecutive_failures: AtomicUsize,
    metrics: Arc<Metrics>,
}

impl Pool {
    pub fn new(
        host: Arc<Host>,
        version: ProtocolVersion,
        opts: Arc<Opts>,
        session_keyspace: Arc<RwLock<Option<String>>>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            host,
            opts,
            version,
            session_keyspace,
            connections: RwLock::new(Vec::new()),
            ready_notify: Notify::new(),
            maintain_notify: Notify::new(),
            waiters: AtomicUsize::new(0),
            want_grow: AtomicBool::new(false),
            is_closing: AtomicBool::new(false),
            is_critical_failure: AtomicBool::new(false),
            consecutive_failures: AtomicUsize::new(0),
            metrics,
        });
        tokio::spawn(maintain_task(Arc::clone(&pool)));
        pool
    }

    pub fn is_critical_failure(&self) -> bool {
        self.is_critical_failure.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Sum of in-flight requests across connections (host load signal).
    pub fn in_flight(&self) -> usize {
        self.connections.read().iter().map(|c| c.in_flight()).sum()
    }

    /// External event (UP, NEW_NODE): clear the critical flag and retry
    /// immediately.
    pub fn kick(&self) {
        self.is_critical_failure.store(false, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.maintain_notify.notify_one();
    }

    fn least_busy(&self) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .filter(|c| !c.is_closed() && c.has_free_streams())
            .min_by_key(|c| c.in_flight())
            .cloned()
    }

    /// A ready connection, or park until one frees up. Parking is bounded by
    /// `max_pending_requests_per_pool`; overflow fails fast so the request
    /// handler can move to the next host.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        loop {
            if self.is_closing.load(Ordering::Acquire) {
                return Err(Error::ConnectionClosed);
            }
            // Register for wakeups before re-checking, so a connection that
            // becomes ready in between is not missed.
            let mut notified = std::pin::pin!(self.ready_notify.notified());
            notified.as_mut().enable();
            if let Some(connection) = self.least_busy() {
                self.maybe_grow(&connection);
                return Ok(connection);
            }
            if self.is_critical_failure() {
                return Err(Error::ConnectionClosed);
            }
            let _guard = WaiterGuard::park(&self.waiters, self.opts.max_pending_requests_per_pool)
                .ok_or(Error::RequestQueueFull)?;
            notified.await;
        }
    }

    /// Spawn another connection when the least-busy one is already above the
    /// concurrency threshold.
    fn maybe_grow(&self, least_busy: &Connection) {
        if least_busy.in_flight() >= self.opts.max_concurrent_requests_threshold
            && self.connection_count() < self.opts.max_connections_per_host
        {
            self.want_grow.store(true, Ordering::Release);
            self.maintain_notify.notify_one();
        }
    }

    /// Close every connection and wake all waiters. Idempotent.
    pub fn close(&self) {
        if self.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for connection in self.connections.read().iter() {
            connection.close();
        }
        self.ready_notify.notify_waiters();
        self.maintain_notify.notify_one();
    }

    /// Close and wait for every connection to fully wind down.
    pub async fn close_and_drain(&self) {
        self.close();
        let connections: Vec<Arc<Connection>> = self.connections.read().clone();
        for connection in connections {
            connection.closed().await;
        }
    }

    fn remove_connection(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.write();
        connections.retain(|c| !Arc::ptr_eq(c, connection));
    }
}

/// Bounded park slot in the pool's pending queue; released on drop, so a
/// cancelled waiter never leaks its slot.
struct WaiterGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn park(counter: &'a AtomicUsize, limit: usize) -> Option<Self> {
        if counter.fetch_add(1, Ordering::AcqRel) >= limit {
            counter.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self { counter })
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

fn backoff_delay(opts: &Opts, attempt: usize) -> Duration {
    let base = opts.reconnect_base_ms.max(1);
    let cap = opts.reconnect_cap_ms.max(base);
    let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
    let jitter = rand::thread_rng().gen_range(0..=exp / 8 + 1);
    Duration::from_millis(exp + jitter)
}

/// Keeps the pool at `core` connections, grows on demand, and backs off on
/// failures. One task per pool.
async fn maintain_task(pool: Arc<Pool>) {
    loop {
        if pool.is_closing.load(Ordering::Acquire) {
            return;
        }

        let live = pool.connection_count();
        let want_grow = pool.want_grow.swap(false, Ordering::AcqRel);
        let target = if want_grow {
            (live + 1).min(pool.opts.max_connections_per_host)
        } else {
            pool.opts.core_connections_per_host
        };

        if live >= target {
            // Nothing to do until a connection dies or growth is requested.
            pool.maintain_notify.notified().await;
            continue;
        }

        let keyspace = pool.session_keyspace.read().clone();
        match Connection::connect(
            &pool.host.address,
            pool.version,
            &pool.opts,
            keyspace,
            false,
            None,
            Arc::clone(&pool.metrics),
        )
        .await
        {
            Ok(connection) => {
                pool.consecutive_failures.store(0, Ordering::Relaxed);
                pool.is_critical_failure.store(false, Ordering::Release);
                pool.host.set_up(true);
                if pool.is_closing.load(Ordering::Acquire) {
                    connection.close();
                    return;
                }
                pool.connections.write().push(Arc::clone(&connection));
                pool.ready_notify.notify_waiters();
                debug!(host = %pool.host.address, count = pool.connection_count(), "pool connection ready");

                // Watch for this connection closing; reconnection is scoped
                // to the lost connection only.
                let watch_pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    connection.closed().await;
                    if connection.is_defunct() {
                        debug!(host = %watch_pool.host.address, "connection defunct");
                    }
                    watch_pool.remove_connection(&connection);
                    watch_pool.maintain_notify.notify_one();
                });
            }
            Err(e) => {
                let failures = pool.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(host = %pool.host.address, error = %e, failures, "pool connect failed");
                if failures >= CRITICAL_FAILURE_THRESHOLD && pool.connection_count() == 0 {
                    // Take the host down until an external event kicks us.
                    pool.is_critical_failure.store(true, Ordering::Release);
                    pool.host.set_up(false);
                    pool.ready_notify.notify_waiters();
                    pool.maintain_notify.notified().await;
                } else {
                    tokio::time::sleep(backoff_delay(&pool.opts, failures)).await;
                }
            }
        }
    }
}
