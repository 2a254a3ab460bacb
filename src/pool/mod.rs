//! Dual-kind connection pool for the page and log services.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Config, PoolConfig};
use crate::remote::{LogClient, LogService, PageClient, PageService};
use crate::types::{Lsn, NimbusError, Result, ServiceKind, TimelineId, WalRecord};

mod service;

pub use service::{
    ConnectionId, Connector, Lease, Pooled, Probe, ServicePool, ServicePoolStats,
};

/// Pooled page-service connection.
pub type PageConn = Box<dyn PageService>;
/// Pooled log-service connection.
pub type LogConn = Box<dyn LogService>;

impl Probe for PageConn {
    fn probe(&mut self) -> Result<()> {
        self.check_availability()
    }
}

impl Probe for LogConn {
    fn probe(&mut self) -> Result<()> {
        self.check_availability()
    }
}

/// Sizes and hit rates of both pools.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolStats {
    /// Page connections owned by the pool.
    pub page_total: usize,
    /// Idle page connections.
    pub page_available: usize,
    /// Log connections owned by the pool.
    pub log_total: usize,
    /// Idle log connections.
    pub log_available: usize,
    /// Page acquire calls.
    pub page_requests: u64,
    /// Log acquire calls.
    pub log_requests: u64,
    /// Page acquires served from idle connections.
    pub page_hit_rate: f64,
    /// Log acquires served from idle connections.
    pub log_hit_rate: f64,
}

impl PoolStats {
    fn from_parts(page: ServicePoolStats, log: ServicePoolStats) -> Self {
        Self {
            page_total: page.total,
            page_available: page.available,
            log_total: log.total,
            log_available: log.available,
            page_requests: page.requests,
            log_requests: log.requests,
            page_hit_rate: page.hit_rate,
            log_hit_rate: log.hit_rate,
        }
    }
}

struct HealthState {
    stopped: bool,
    interval: Duration,
}

struct HealthSignal {
    state: Mutex<HealthState>,
    wake: Condvar,
}

struct HealthWorker {
    signal: Arc<HealthSignal>,
    handle: JoinHandle<()>,
}

/// Owns the page and log pools plus the background health-check loop.
pub struct ConnectionPool {
    page: ServicePool<PageConn>,
    log: ServicePool<LogConn>,
    acquire_timeout: Duration,
    scale_threshold: f64,
    signal: Arc<HealthSignal>,
    worker: Mutex<Option<HealthWorker>>,
}

impl ConnectionPool {
    /// Creates a pool from explicit connectors. No connection is opened yet.
    pub fn new(
        limits: PoolConfig,
        acquire_timeout: Duration,
        health_check_interval: Duration,
        scale_threshold: f64,
        page_connector: impl Connector<PageConn>,
        log_connector: impl Connector<LogConn>,
    ) -> Self {
        Self {
            page: ServicePool::new(
                ServiceKind::Page,
                limits.min_page,
                limits.max_page,
                page_connector,
            ),
            log: ServicePool::new(
                ServiceKind::Log,
                limits.min_log,
                limits.max_log,
                log_connector,
            ),
            acquire_timeout,
            scale_threshold,
            signal: Arc::new(HealthSignal {
                state: Mutex::new(HealthState {
                    stopped: false,
                    interval: health_check_interval,
                }),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Creates a pool whose connectors open [`PageClient`] and [`LogClient`]s.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let page_url = config.page_service_url.clone();
        let log_addr = config.log_service_addr.clone();
        let timeout = config.request_timeout();
        Ok(Self::new(
            config.pool,
            config.acquire_timeout(),
            config.health_check_interval(),
            config.scale_hit_rate_threshold,
            move || -> Result<PageConn> { Ok(Box::new(PageClient::connect(&page_url, timeout)?)) },
            move || -> Result<LogConn> {
                Ok(Box::new(LogClient::connect_to(log_addr.clone(), timeout)?))
            },
        ))
    }

    /// Warms both pools and starts the health-check thread.
    ///
    /// Fails only when the thread cannot be spawned. Calling it twice is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let (page, log) = self.warm();
        self.signal.state.lock().stopped = false;
        let signal = Arc::clone(&self.signal);
        let page_pool = self.page.clone();
        let log_pool = self.log.clone();
        let threshold = self.scale_threshold;
        let handle = thread::Builder::new()
            .name("nimbus-pool-health".into())
            .spawn(move || health_loop(signal, page_pool, log_pool, threshold))?;
        *worker = Some(HealthWorker {
            signal: Arc::clone(&self.signal),
            handle,
        });
        info!(page, log, "pool.initialized");
        Ok(())
    }

    /// Opens connections up to each configured minimum.
    pub fn warm(&self) -> (usize, usize) {
        let page = self.page.warm();
        let log = self.log.warm();
        debug!(page, log, "pool.warmed");
        (page, log)
    }

    /// Page pool.
    pub fn page_pool(&self) -> &ServicePool<PageConn> {
        &self.page
    }

    /// Log pool.
    pub fn log_pool(&self) -> &ServicePool<LogConn> {
        &self.log
    }

    /// Default wait used by the lease helpers.
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Leases a page connection, waiting up to `timeout`.
    pub fn acquire_page(&self, timeout: Duration) -> Result<Pooled<PageConn>> {
        self.page.acquire(timeout)
    }

    /// Leases a log connection, waiting up to `timeout`.
    pub fn acquire_log(&self, timeout: Duration) -> Result<Pooled<LogConn>> {
        self.log.acquire(timeout)
    }

    /// Returns a page connection obtained from [`ConnectionPool::acquire_page`].
    pub fn release_page(&self, conn: Pooled<PageConn>) {
        self.page.release(conn);
    }

    /// Returns a log connection obtained from [`ConnectionPool::acquire_log`].
    pub fn release_log(&self, conn: Pooled<LogConn>) {
        self.log.release(conn);
    }

    /// Guarded page lease using the default acquire timeout.
    pub fn page_lease(&self) -> Result<Lease<PageConn>> {
        self.page.lease(self.acquire_timeout)
    }

    /// Guarded log lease using the default acquire timeout.
    pub fn log_lease(&self) -> Result<Lease<LogConn>> {
        self.log.lease(self.acquire_timeout)
    }

    /// One health pass: probe idle connections, then grow pools with low hit rates.
    pub fn run_health_check(&self) -> usize {
        run_health_pass(&self.page, &self.log, self.scale_threshold)
    }

    /// Grows each pool by one connection when its hit rate is low.
    pub fn scale_if_needed(&self) {
        self.page.scale_if_needed(self.scale_threshold);
        self.log.scale_if_needed(self.scale_threshold);
    }

    /// Sizes and hit rates of both pools.
    pub fn stats(&self) -> PoolStats {
        PoolStats::from_parts(self.page.stats(), self.log.stats())
    }

    /// Zeroes request and hit counters.
    pub fn reset_stats(&self) {
        self.page.reset_stats();
        self.log.reset_stats();
    }

    /// Changes the health-check period; the running loop picks it up immediately.
    pub fn set_health_check_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(NimbusError::Invalid("health check interval must be positive"));
        }
        self.signal.state.lock().interval = interval;
        self.signal.wake.notify_all();
        Ok(())
    }

    /// Changes the limits of both pools. Nothing changes if either pair is invalid.
    pub fn set_limits(&self, limits: PoolConfig) -> Result<()> {
        limits.validate()?;
        self.page.set_limits(limits.min_page, limits.max_page)?;
        self.log.set_limits(limits.min_log, limits.max_log)
    }

    /// Stops the health loop, drops every idle connection and reports final stats.
    pub fn shutdown(&self) -> PoolStats {
        self.stop_worker();
        let stats = PoolStats::from_parts(self.page.shutdown(), self.log.shutdown());
        info!(
            page_hit_rate = stats.page_hit_rate,
            log_hit_rate = stats.log_hit_rate,
            "pool.shutdown"
        );
        stats
    }

    fn stop_worker(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.signal.state.lock().stopped = true;
        worker.signal.wake.notify_all();
        if worker.handle.join().is_err() {
            warn!("pool.health.worker_panicked");
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

impl crate::pipeline::AppendSink for ConnectionPool {
    fn append(&self, timeline: TimelineId, record: &WalRecord) -> Result<Lsn> {
        let mut lease = self.log_lease()?;
        match lease.append(timeline, record) {
            Ok(lsn) => Ok(lsn),
            Err(err @ NimbusError::Protocol(_)) => {
                lease.discard();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

fn run_health_pass(
    page: &ServicePool<PageConn>,
    log: &ServicePool<LogConn>,
    threshold: f64,
) -> usize {
    let removed = page.health_check() + log.health_check();
    page.scale_if_needed(threshold);
    log.scale_if_needed(threshold);
    if removed > 0 {
        info!(removed, "pool.health.pass");
    }
    removed
}

fn health_loop(
    signal: Arc<HealthSignal>,
    page: ServicePool<PageConn>,
    log: ServicePool<LogConn>,
    threshold: f64,
) {
    debug!("pool.health.started");
    loop {
        {
            let mut state = signal.state.lock();
            if state.stopped {
                break;
            }
            let interval = state.interval;
            let timed_out = signal.wake.wait_for(&mut state, interval).timed_out();
            if state.stopped {
                break;
            }
            if !timed_out {
                // Interval changed; start a fresh wait.
                continue;
            }
        }
        run_health_pass(&page, &log, threshold);
    }
    debug!("pool.health.stopped");
}
