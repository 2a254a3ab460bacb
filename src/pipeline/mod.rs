//! Single-worker append queue that takes WAL round-trips off the caller's path.
//!
//! Requests are sent strictly in submission order. Every request carries a
//! ticket, so callers that need durability can wait for the committed
//! position while fire-and-forget callers just drop it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{Lsn, NimbusError, Result, TimelineId, WalRecord};

/// Destination of queued appends.
pub trait AppendSink: Send + Sync + 'static {
    /// Sends one record and returns the committed position.
    fn append(&self, timeline: TimelineId, record: &WalRecord) -> Result<Lsn>;
}

/// Handle to the outcome of one submitted append.
pub struct AppendTicket {
    request: Arc<AppendRequest>,
}

impl AppendTicket {
    /// Blocks until the append is sent, failed, or cancelled.
    pub fn wait(self) -> Result<Lsn> {
        let mut guard = self.request.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.request.cv.wait(&mut guard);
        }
    }

    /// Waits up to `timeout`; `None` when the append is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Lsn>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.request.result.lock();
        while guard.is_none() {
            if self.request.cv.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.as_ref().map(copy_outcome)
    }

    /// Outcome if already known.
    pub fn try_result(&self) -> Option<Result<Lsn>> {
        self.request.result.lock().as_ref().map(copy_outcome)
    }

    /// LSN the record was submitted with.
    pub fn lsn(&self) -> Lsn {
        self.request.record.lsn()
    }
}

fn copy_outcome(outcome: &Result<Lsn>) -> Result<Lsn> {
    match outcome {
        Ok(lsn) => Ok(*lsn),
        Err(err) => Err(err.duplicate()),
    }
}

struct AppendRequest {
    timeline: TimelineId,
    record: WalRecord,
    result: Mutex<Option<Result<Lsn>>>,
    cv: Condvar,
}

impl AppendRequest {
    fn new(timeline: TimelineId, record: WalRecord) -> Self {
        Self {
            timeline,
            record,
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn finish(&self, outcome: Result<Lsn>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<AppendRequest>>,
    stopping: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

/// FIFO append queue drained by exactly one background thread.
pub struct AppendPipeline {
    queue: Arc<Queue>,
    worker: Mutex<Option<JoinHandle<()>>>,
    drain_on_shutdown: bool,
}

impl AppendPipeline {
    /// Spawns the worker thread.
    ///
    /// `drain_on_shutdown` decides whether [`AppendPipeline::shutdown`] sends
    /// the queued requests or cancels them.
    pub fn start(
        name: &str,
        sink: Arc<dyn AppendSink>,
        drain_on_shutdown: bool,
    ) -> Result<Self> {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        });
        let worker_queue = Arc::clone(&queue);
        let handle = thread::Builder::new()
            .name(format!("nimbus-append-{name}"))
            .spawn(move || worker_loop(worker_queue, sink))?;
        Ok(Self {
            queue,
            worker: Mutex::new(Some(handle)),
            drain_on_shutdown,
        })
    }

    /// Queues one record and returns immediately.
    pub fn submit(&self, timeline: TimelineId, record: WalRecord) -> Result<AppendTicket> {
        let request = Arc::new(AppendRequest::new(timeline, record));
        let mut state = self.queue.state.lock();
        if state.stopping {
            return Err(NimbusError::ShutDown);
        }
        state.pending.push_back(Arc::clone(&request));
        debug!(
            timeline = %timeline,
            lsn = %request.record.lsn(),
            pending = state.pending.len(),
            "pipeline.enqueue"
        );
        self.queue.wakeup.notify_one();
        Ok(AppendTicket { request })
    }

    /// Queues one record and waits for its acknowledgment.
    pub fn append(&self, timeline: TimelineId, record: WalRecord) -> Result<Lsn> {
        self.submit(timeline, record)?.wait()
    }

    /// Requests not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.queue.state.lock().pending.len()
    }

    /// Stops the worker using the policy chosen at start.
    pub fn shutdown(&self) {
        self.shutdown_with(self.drain_on_shutdown);
    }

    /// Stops accepting requests and joins the worker.
    ///
    /// With `drain` the queue is sent first; otherwise every queued ticket
    /// resolves to [`NimbusError::Cancelled`]. The request in flight always
    /// completes. Calling it again is a no-op.
    pub fn shutdown_with(&self, drain: bool) {
        let cancelled = {
            let mut state = self.queue.state.lock();
            state.stopping = true;
            if drain {
                VecDeque::new()
            } else {
                std::mem::take(&mut state.pending)
            }
        };
        self.queue.wakeup.notify_all();
        if !cancelled.is_empty() {
            warn!(cancelled = cancelled.len(), "pipeline.shutdown.cancelled");
        }
        for request in cancelled {
            request.finish(Err(NimbusError::Cancelled));
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("pipeline.worker_panicked");
            }
        }
    }
}

impl Drop for AppendPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: Arc<Queue>, sink: Arc<dyn AppendSink>) {
    loop {
        let request = {
            let mut state = queue.state.lock();
            loop {
                if let Some(request) = state.pending.pop_front() {
                    break request;
                }
                if state.stopping {
                    debug!("pipeline.worker_exit");
                    return;
                }
                queue.wakeup.wait(&mut state);
            }
        };
        let outcome = sink.append(request.timeline, &request.record);
        match &outcome {
            Ok(committed) => debug!(
                timeline = %request.timeline,
                lsn = %request.record.lsn(),
                committed = %committed,
                "pipeline.append.done"
            ),
            Err(err) => warn!(
                timeline = %request.timeline,
                lsn = %request.record.lsn(),
                error = %err,
                "pipeline.append.failed"
            ),
        }
        request.finish(outcome);
    }
}
