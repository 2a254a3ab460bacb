use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::types::{NimbusError, Result, ServiceKind};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Creates new connections for a pool.
pub trait Connector<C>: Send + Sync + 'static {
    /// Opens one connection. Failures are reported, never retried here.
    fn connect(&self) -> Result<C>;
}

impl<C, F> Connector<C> for F
where
    F: Fn() -> Result<C> + Send + Sync + 'static,
{
    fn connect(&self) -> Result<C> {
        self()
    }
}

/// Liveness probe run on idle connections by the health check.
pub trait Probe {
    /// Returns an error when the connection should be discarded.
    fn probe(&mut self) -> Result<()>;
}

/// Identity of one pooled connection, unique for the whole process.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connection together with its pool identity.
pub struct Pooled<C> {
    id: ConnectionId,
    conn: C,
}

impl<C> Pooled<C> {
    fn new(conn: C) -> Self {
        Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            conn,
        }
    }

    /// Identity used by the pool when the connection is returned.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl<C> fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<C> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

/// Counters of one pool.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ServicePoolStats {
    /// Connections owned by the pool, leased or not.
    pub total: usize,
    /// Connections ready to be leased.
    pub available: usize,
    /// Acquire calls since the last reset.
    pub requests: u64,
    /// Acquire calls served without creating a connection.
    pub hits: u64,
    /// `hits / requests`, or 1.0 with no requests.
    pub hit_rate: f64,
}

struct SlotState<C> {
    available: Vec<Pooled<C>>,
    leased: HashSet<ConnectionId>,
    probing: usize,
    connecting: usize,
    min: usize,
    max: usize,
    running: bool,
}

impl<C> SlotState<C> {
    fn total(&self) -> usize {
        self.available.len() + self.leased.len() + self.probing + self.connecting
    }
}

struct Shared<C> {
    kind: ServiceKind,
    state: Mutex<SlotState<C>>,
    returned: Condvar,
    connector: Box<dyn Connector<C>>,
    requests: AtomicU64,
    hits: AtomicU64,
}

/// Bounded pool of connections to one service.
///
/// Idle connections are kept on a stack, so a connection released with no
/// one waiting is the next one handed out.
pub struct ServicePool<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ServicePool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Probe + Send + 'static> ServicePool<C> {
    /// Creates an empty pool; call [`ServicePool::warm`] to open connections.
    pub fn new(kind: ServiceKind, min: usize, max: usize, connector: impl Connector<C>) -> Self {
        Self {
            shared: Arc::new(Shared {
                kind,
                state: Mutex::new(SlotState {
                    available: Vec::with_capacity(max),
                    leased: HashSet::with_capacity(max),
                    probing: 0,
                    connecting: 0,
                    min,
                    max,
                    running: true,
                }),
                returned: Condvar::new(),
                connector: Box::new(connector),
                requests: AtomicU64::new(0),
                hits: AtomicU64::new(0),
            }),
        }
    }

    /// Service this pool connects to.
    pub fn kind(&self) -> ServiceKind {
        self.shared.kind
    }

    /// Opens connections until the pool holds its minimum.
    ///
    /// Each failed attempt is logged and skipped. Returns how many
    /// connections were created.
    pub fn warm(&self) -> usize {
        let missing = {
            let state = self.shared.state.lock();
            state.min.saturating_sub(state.total())
        };
        let mut created = 0;
        for attempt in 0..missing {
            if !self.reserve_slot(|state| state.total() < state.min) {
                break;
            }
            match self.create() {
                Ok(conn) => {
                    self.finish_slot(Some(conn));
                    created += 1;
                }
                Err(err) => {
                    self.finish_slot(None);
                    warn!(
                        kind = %self.shared.kind,
                        attempt,
                        error = %err,
                        "pool.warm.connect_failed"
                    );
                }
            }
        }
        debug!(kind = %self.shared.kind, created, "pool.warm");
        created
    }

    /// Leases an idle connection, waiting up to `timeout` for one.
    ///
    /// When the wait times out and the pool is below its maximum, one new
    /// connection is created as a fallback.
    pub fn acquire(&self, timeout: Duration) -> Result<Pooled<C>> {
        let started = Instant::now();
        let deadline = started + timeout;
        self.shared.requests.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.shared.state.lock();
            loop {
                if !state.running {
                    return Err(NimbusError::ShutDown);
                }
                if let Some(conn) = state.available.pop() {
                    state.leased.insert(conn.id);
                    self.shared.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(conn);
                }
                if self
                    .shared
                    .returned
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    if let Some(conn) = state.available.pop() {
                        state.leased.insert(conn.id);
                        self.shared.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(conn);
                    }
                    break;
                }
            }
        }

        if self.reserve_slot(|state| state.running && state.total() < state.max) {
            match self.create() {
                Ok(conn) => {
                    let mut state = self.shared.state.lock();
                    state.connecting -= 1;
                    if state.running {
                        let pooled = Pooled::new(conn);
                        state.leased.insert(pooled.id);
                        debug!(kind = %self.shared.kind, id = %pooled.id, "pool.acquire.created");
                        return Ok(pooled);
                    }
                    return Err(NimbusError::ShutDown);
                }
                Err(err) => {
                    self.finish_slot(None);
                    warn!(kind = %self.shared.kind, error = %err, "pool.acquire.connect_failed");
                }
            }
        }

        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        warn!(kind = %self.shared.kind, waited_ms, "pool.acquire.timeout");
        Err(NimbusError::Unavailable {
            kind: self.shared.kind,
            waited_ms,
        })
    }

    /// Leases a connection wrapped in a guard that returns it on drop.
    pub fn lease(&self, timeout: Duration) -> Result<Lease<C>> {
        let conn = self.acquire(timeout)?;
        Ok(Lease {
            pool: self.clone(),
            conn: Some(conn),
        })
    }

    /// Returns a leased connection and wakes one waiter.
    ///
    /// Connections this pool did not lease out are dropped with a warning.
    pub fn release(&self, conn: Pooled<C>) {
        let mut state = self.shared.state.lock();
        if !state.leased.remove(&conn.id) {
            warn!(kind = %self.shared.kind, id = %conn.id, "pool.release.unknown");
            return;
        }
        if !state.running {
            debug!(kind = %self.shared.kind, id = %conn.id, "pool.release.after_shutdown");
            return;
        }
        state.available.push(conn);
        self.shared.returned.notify_one();
    }

    /// Probes every idle connection and drops the ones that fail.
    ///
    /// Probing happens outside the pool lock. Returns the number removed.
    pub fn health_check(&self) -> usize {
        let idle = {
            let mut state = self.shared.state.lock();
            let idle = std::mem::take(&mut state.available);
            state.probing += idle.len();
            idle
        };
        let probed = idle.len();
        let mut healthy = Vec::with_capacity(probed);
        let mut removed = 0;
        for mut conn in idle {
            match conn.probe() {
                Ok(()) => healthy.push(conn),
                Err(err) => {
                    removed += 1;
                    warn!(
                        kind = %self.shared.kind,
                        id = %conn.id,
                        error = %err,
                        "pool.health.removed"
                    );
                }
            }
        }
        let mut state = self.shared.state.lock();
        state.probing -= probed;
        if state.running {
            // Connections released during probing stay on top of the stack.
            let released = std::mem::replace(&mut state.available, healthy);
            state.available.extend(released);
            self.shared.returned.notify_all();
        }
        removed
    }

    /// Adds one connection when the hit rate is below `threshold`.
    ///
    /// Returns true when a connection was added.
    pub fn scale_if_needed(&self, threshold: f64) -> bool {
        if self.stats().hit_rate >= threshold {
            return false;
        }
        if !self.reserve_slot(|state| state.running && state.total() < state.max) {
            return false;
        }
        match self.create() {
            Ok(conn) => {
                let total = self.finish_slot(Some(conn));
                info!(kind = %self.shared.kind, total, "pool.scaled_up");
                true
            }
            Err(err) => {
                self.finish_slot(None);
                warn!(kind = %self.shared.kind, error = %err, "pool.scale.connect_failed");
                false
            }
        }
    }

    /// Snapshot of sizes and counters.
    pub fn stats(&self) -> ServicePoolStats {
        let (total, available) = {
            let state = self.shared.state.lock();
            (state.total(), state.available.len())
        };
        let requests = self.shared.requests.load(Ordering::Relaxed);
        let hits = self.shared.hits.load(Ordering::Relaxed);
        let hit_rate = if requests == 0 {
            1.0
        } else {
            hits as f64 / requests as f64
        };
        ServicePoolStats {
            total,
            available,
            requests,
            hits,
            hit_rate,
        }
    }

    /// Zeroes the request and hit counters.
    pub fn reset_stats(&self) {
        self.shared.requests.store(0, Ordering::Relaxed);
        self.shared.hits.store(0, Ordering::Relaxed);
    }

    /// Changes the connection limits. Existing connections are kept.
    pub fn set_limits(&self, min: usize, max: usize) -> Result<()> {
        if max == 0 || min > max {
            return Err(NimbusError::InvalidOwned(format!(
                "invalid {} pool limits min={min} max={max}",
                self.shared.kind
            )));
        }
        let mut state = self.shared.state.lock();
        state.min = min;
        state.max = max;
        Ok(())
    }

    /// Stops leasing and drops every idle connection.
    ///
    /// Leased connections are dropped when they are released.
    pub fn shutdown(&self) -> ServicePoolStats {
        let drained = {
            let mut state = self.shared.state.lock();
            state.running = false;
            std::mem::take(&mut state.available)
        };
        self.shared.returned.notify_all();
        debug!(kind = %self.shared.kind, drained = drained.len(), "pool.shutdown");
        drop(drained);
        self.stats()
    }

    fn create(&self) -> Result<C> {
        let mut conn = self.shared.connector.connect()?;
        conn.probe()?;
        Ok(conn)
    }

    fn reserve_slot(&self, allowed: impl FnOnce(&SlotState<C>) -> bool) -> bool {
        let mut state = self.shared.state.lock();
        if !allowed(&state) {
            return false;
        }
        state.connecting += 1;
        true
    }

    /// Settles a reservation made by `reserve_slot`; returns the pool size.
    fn finish_slot(&self, conn: Option<C>) -> usize {
        let mut state = self.shared.state.lock();
        state.connecting -= 1;
        if let Some(conn) = conn {
            if state.running {
                state.available.push(Pooled::new(conn));
                self.shared.returned.notify_one();
            }
        }
        state.total()
    }
}

/// Exclusive lease on one pooled connection, returned on drop.
pub struct Lease<C: Probe + Send + 'static> {
    pool: ServicePool<C>,
    conn: Option<Pooled<C>>,
}

impl<C: Probe + Send + 'static> Lease<C> {
    /// Identity of the leased connection.
    pub fn id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(Pooled::id)
    }

    /// Returns the connection before the guard goes out of scope.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// Drops the connection instead of returning it, e.g. after a protocol error.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            let mut state = self.pool.shared.state.lock();
            state.leased.remove(&conn.id);
            debug!(kind = %self.pool.shared.kind, id = %conn.id, "pool.lease.discarded");
        }
    }
}

impl<C: Probe + Send + 'static> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("kind", &self.pool.shared.kind)
            .field("id", &self.id())
            .finish()
    }
}

impl<C: Probe + Send + 'static> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: Probe + Send + 'static> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: Probe + Send + 'static> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
