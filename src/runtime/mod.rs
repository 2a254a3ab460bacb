//! Compute-node runtime: one context per process, one session per open table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, InsertOutcome, PageCache, WriteBack};
use crate::config::Config;
use crate::pipeline::{AppendPipeline, AppendSink, AppendTicket};
use crate::pool::{ConnectionPool, PoolStats};
use crate::remote::{LogService, PageService};
use crate::types::{
    Lsn, NimbusError, PageBuf, PageId, Result, TimelineId, WalRecord, PAGE_SIZE,
};

/// Request counters shared by every session of a context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfStats {
    /// Page reads, page writes and row appends issued by sessions.
    pub total_requests: u64,
    /// Page reads answered by the cache.
    pub cache_hits: u64,
    /// Round-trips to either remote service.
    pub network_calls: u64,
    /// Wall time spent in those round-trips.
    pub total_latency_ms: u64,
}

#[derive(Default)]
struct PerfCounters {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    network_calls: AtomicU64,
    total_latency_ms: AtomicU64,
}

impl PerfCounters {
    fn request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn network(&self, started: Instant) {
        self.network_calls.fetch_add(1, Ordering::Relaxed);
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.total_latency_ms.fetch_add(elapsed, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PerfStats {
        PerfStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            network_calls: self.network_calls.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.network_calls.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
    }
}

/// Process-wide state: the connection pool, configuration and counters.
///
/// Passed explicitly to whoever opens tables; there is no global instance.
pub struct ComputeContext {
    pool: Arc<ConnectionPool>,
    config: Config,
    perf: Arc<PerfCounters>,
}

impl ComputeContext {
    /// Builds the pool from `config`, warms it and starts its health loop.
    pub fn start(config: Config) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::from_config(&config)?);
        pool.initialize()?;
        info!(
            page_service = %config.page_service_url,
            log_service = %config.log_service_addr,
            "runtime.started"
        );
        Self::with_pool(pool, config)
    }

    /// Uses an existing pool. The caller decides whether it is initialized.
    pub fn with_pool(pool: Arc<ConnectionPool>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            config,
            perf: Arc::new(PerfCounters::default()),
        })
    }

    /// Shared connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the timeline backing `table` on the page service, then the log service.
    pub fn create_table_timeline(&self, table: &str) -> Result<TimelineId> {
        let timeline = TimelineId::from_table_name(table);
        let started = Instant::now();
        self.pool.page_lease()?.create_timeline(timeline)?;
        self.perf.network(started);
        let started = Instant::now();
        self.pool.log_lease()?.create_timeline(timeline)?;
        self.perf.network(started);
        info!(table, timeline = %timeline, "runtime.timeline.created");
        Ok(timeline)
    }

    /// Deletes the timeline backing `table` from both services.
    pub fn delete_table_timeline(&self, table: &str) -> Result<TimelineId> {
        let timeline = TimelineId::from_table_name(table);
        let started = Instant::now();
        self.pool.page_lease()?.delete_timeline(timeline)?;
        self.perf.network(started);
        let started = Instant::now();
        self.pool.log_lease()?.delete_timeline(timeline)?;
        self.perf.network(started);
        info!(table, timeline = %timeline, "runtime.timeline.deleted");
        Ok(timeline)
    }

    /// Drops the timeline of `from` and creates a fresh one for `to`.
    ///
    /// Data is not carried over.
    pub fn rename_table_timeline(&self, from: &str, to: &str) -> Result<TimelineId> {
        self.delete_table_timeline(from)?;
        self.create_table_timeline(to)
    }

    /// Latest durable position the page service reports for `table`.
    pub fn table_lsn(&self, table: &str) -> Result<Lsn> {
        let timeline = TimelineId::from_table_name(table);
        let started = Instant::now();
        let lsn = self.pool.page_lease()?.timeline_info(timeline)?;
        self.perf.network(started);
        Ok(lsn)
    }

    /// Opens a session on `table`.
    ///
    /// Leases one connection of each kind to make sure both services are
    /// reachable, then returns them.
    pub fn open_table(&self, table: &str) -> Result<TimelineSession> {
        let timeline = TimelineId::from_table_name(table);
        self.pool.page_lease()?.release();
        self.pool.log_lease()?.release();

        let sink: Arc<dyn AppendSink> = Arc::new(CountingSink {
            pool: Arc::clone(&self.pool),
            perf: Arc::clone(&self.perf),
        });
        let pipeline = AppendPipeline::start(
            &timeline.to_string(),
            sink,
            self.config.drain_on_shutdown,
        )?;
        let writer = Arc::new(SessionWriter {
            timeline,
            next_lsn: Mutex::new(1),
            pipeline,
        });
        let cache = PageCache::new(
            self.config.cache_pages,
            Arc::clone(&writer) as Arc<dyn WriteBack>,
        )?;
        debug!(table, timeline = %timeline, "runtime.table.opened");
        Ok(TimelineSession {
            table: table.to_string(),
            timeline,
            pool: Arc::clone(&self.pool),
            cache,
            writer,
            perf: Arc::clone(&self.perf),
        })
    }

    /// Counters accumulated by every session.
    pub fn perf_stats(&self) -> PerfStats {
        self.perf.snapshot()
    }

    /// Zeroes the counters.
    pub fn reset_perf_stats(&self) {
        self.perf.reset();
    }

    /// Pool sizes and hit rates.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stops the pool. Sessions still open fail with [`NimbusError::ShutDown`].
    pub fn shutdown(&self) -> PoolStats {
        let perf = self.perf.snapshot();
        info!(
            total_requests = perf.total_requests,
            cache_hits = perf.cache_hits,
            network_calls = perf.network_calls,
            "runtime.shutdown"
        );
        self.pool.shutdown()
    }
}

/// Pipeline sink that times every append sent to the log service.
struct CountingSink {
    pool: Arc<ConnectionPool>,
    perf: Arc<PerfCounters>,
}

impl AppendSink for CountingSink {
    fn append(&self, timeline: TimelineId, record: &WalRecord) -> Result<Lsn> {
        let started = Instant::now();
        let result = self.pool.append(timeline, record);
        if !matches!(
            result,
            Err(NimbusError::Unavailable { .. }) | Err(NimbusError::ShutDown)
        ) {
            self.perf.network(started);
        }
        result
    }
}

/// Assigns LSNs and feeds the session's pipeline.
struct SessionWriter {
    timeline: TimelineId,
    next_lsn: Mutex<u64>,
    pipeline: AppendPipeline,
}

impl SessionWriter {
    /// Queues `data` under the next LSN.
    ///
    /// The counter lock is held across the enqueue so LSN order and queue
    /// order never diverge.
    fn submit(&self, data: Bytes) -> Result<AppendTicket> {
        let mut next = self.next_lsn.lock();
        let record = WalRecord::new(Lsn(*next), data)?;
        let ticket = self.pipeline.submit(self.timeline, record)?;
        *next += 1;
        Ok(ticket)
    }

    fn append(&self, data: Bytes) -> Result<Lsn> {
        self.submit(data)?.wait()
    }

    fn last_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.lock().saturating_sub(1))
    }
}

impl WriteBack for SessionWriter {
    fn write_back(&self, page_id: PageId, data: &[u8]) -> Result<Lsn> {
        self.append(page_image(page_id, data))
    }
}

/// WAL payload of a full page image: little-endian page number, then the page.
fn page_image(page_id: PageId, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32_le(page_id.page_number);
    buf.put_slice(data);
    buf.freeze()
}

/// Per-table handle: page cache, LSN counter and append pipeline.
pub struct TimelineSession {
    table: String,
    timeline: TimelineId,
    pool: Arc<ConnectionPool>,
    cache: PageCache,
    writer: Arc<SessionWriter>,
    perf: Arc<PerfCounters>,
}

impl TimelineSession {
    /// Table this session was opened on.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Timeline backing the table.
    pub fn timeline(&self) -> TimelineId {
        self.timeline
    }

    /// Last LSN handed out, `Lsn(0)` before the first append.
    pub fn last_lsn(&self) -> Lsn {
        self.writer.last_lsn()
    }

    /// Reads a page through the cache, fetching it on a miss.
    pub fn read_page(&self, page_number: u32) -> Result<PageBuf> {
        let page_id = PageId::new(self.timeline, page_number);
        self.perf.request();
        if let Some(data) = self.cache.lookup(&page_id) {
            self.perf.hit();
            return Ok(data);
        }
        let started = Instant::now();
        let fetched = {
            let mut lease = self.pool.page_lease()?;
            lease.read_page(page_id)?
        };
        self.perf.network(started);
        // A write that landed while the fetch was in flight wins over the fetched image.
        let (data, outcome) = self.cache.insert(page_id, fetched)?;
        match outcome {
            InsertOutcome::WriteBackFailed { page_id: lost, error } => {
                warn!(page = %lost, error = %error, "runtime.read.evicted_unflushed");
            }
            outcome => debug!(page = %page_id, ?outcome, "runtime.read.cached"),
        }
        Ok(data)
    }

    /// Logs a full page image and caches it clean.
    pub fn write_page(&self, page_number: u32, data: &[u8]) -> Result<Lsn> {
        check_page_len(data)?;
        let page_id = PageId::new(self.timeline, page_number);
        self.perf.request();
        let lsn = self.writer.append(page_image(page_id, data))?;
        self.cache
            .store(page_id, data.to_vec().into_boxed_slice(), lsn, false)?;
        Ok(lsn)
    }

    /// Caches a modified page without logging it yet.
    ///
    /// The image is written back on eviction, [`TimelineSession::flush`] or close.
    pub fn stage_page(&self, page_number: u32, data: &[u8]) -> Result<()> {
        check_page_len(data)?;
        let page_id = PageId::new(self.timeline, page_number);
        self.cache.store(
            page_id,
            data.to_vec().into_boxed_slice(),
            self.writer.last_lsn(),
            true,
        )?;
        Ok(())
    }

    /// Appends a row mutation and waits for the committed LSN.
    pub fn append_row_mutation(&self, data: impl Into<Bytes>) -> Result<Lsn> {
        self.perf.request();
        self.writer.append(data.into())
    }

    /// Queues a row mutation; the ticket reports the outcome.
    pub fn append_async(&self, data: impl Into<Bytes>) -> Result<AppendTicket> {
        self.perf.request();
        self.writer.submit(data.into())
    }

    /// Writes back every dirty cached page.
    pub fn flush(&self) -> Result<usize> {
        self.cache.flush_dirty()
    }

    /// Cache counters for this table.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Flushes dirty pages and stops the pipeline.
    pub fn close(self) -> Result<()> {
        let flushed = self.flush();
        self.writer.pipeline.shutdown();
        debug!(table = %self.table, "runtime.table.closed");
        flushed.map(|_| ())
    }
}

fn check_page_len(data: &[u8]) -> Result<()> {
    if data.len() == PAGE_SIZE {
        Ok(())
    } else {
        Err(NimbusError::InvalidOwned(format!(
            "page image has {} bytes, expected {PAGE_SIZE}",
            data.len()
        )))
    }
}
