//! Batched write engine in front of the store
//!
//! Decouples caller latency from disk commit latency: `submit` is a
//! micro-enqueue onto a bounded queue, and a dedicated OS thread drains
//! the queue into batched transactions. This keeps SQLite work off the
//! async runtime and makes the writer thread the single writer the store
//! requires.
//!
//! # Architecture
//!
//! ```text
//! IngestService (async)
//!     │
//!     └──→ Batcher::submit ──→ std::sync::mpsc (bounded, try_send)
//!                                  │
//!                                  └──→ Dedicated Writer Thread
//!                                          │
//!                                          ├──→ Batch buffer (batch_size or batch_timeout)
//!                                          ├──→ Store::insert_batch (one transaction)
//!                                          └──→ oneshot completions (assigned ids)
//! ```
//!
//! # Failure ladder
//!
//! A `Retryable` store error retries the whole batch with exponential
//! backoff; once retries exhaust, the batch splits in half and each half
//! recurses, so one poisoned stretch cannot sink its neighbours. A
//! `Permanent` error fails exactly the offending row and commits the
//! prefix and suffix as separate transactions.

use crate::record::LogRecord;
use crate::store::{Store, StoreError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Configuration for the write engine
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Bounded queue capacity; a full queue makes `submit` return
    /// `QueueFull` immediately.
    pub queue_size: usize,
    /// Flush when the batch buffer reaches this many requests.
    pub batch_size: usize,
    /// Flush when the oldest buffered request has waited this long.
    pub batch_timeout: Duration,
    /// Attempts per batch on a retryable store error before splitting.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Retention window for the periodic cleanup (0 = keep forever).
    pub retention_days: u32,
    /// How often the writer thread checks retention on idle ticks.
    pub cleanup_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_millis(10),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(50),
            retention_days: 30,
            cleanup_interval: Duration::from_secs(24 * 3600),
        }
    }
}

/// What a submitted write can fail with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// The bounded queue is at capacity; shed load and retry later.
    QueueFull,
    /// Submitted after shutdown began, or still queued when the drain
    /// deadline fired.
    ShuttingDown,
    /// The store refused the record after the retry ladder ran out.
    Store(String),
    /// The writer dropped the completion without answering.
    Canceled,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::QueueFull => write!(f, "write queue is full"),
            WriteError::ShuttingDown => write!(f, "write engine is shutting down"),
            WriteError::Store(msg) => write!(f, "store rejected the record: {msg}"),
            WriteError::Canceled => write!(f, "write was canceled"),
        }
    }
}

impl std::error::Error for WriteError {}

pub type WriteResult = Result<i64, WriteError>;

/// One queued record plus the channel its assigned id goes back on.
struct WriteRequest {
    record: LogRecord,
    done: oneshot::Sender<WriteResult>,
}

enum Command {
    Write(WriteRequest),
    Shutdown { deadline: Instant },
}

/// Metrics for observability of the write engine itself
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Requests currently sitting in the bounded queue.
    queue_depth: AtomicU64,
    /// Submits rejected because the queue was at capacity.
    queue_full: AtomicU64,
    /// Records durably committed.
    records_written: AtomicU64,
    /// Requests that came back with an error.
    write_errors: AtomicU64,
    /// Requests failed by the shutdown drain deadline.
    timed_out: AtomicU64,
    /// Number of batch flushes.
    flush_count: AtomicU64,
    /// Total flush latency (for averaging).
    flush_latency_us: AtomicU64,
    /// Largest batch committed so far.
    max_batch: AtomicU64,
}

impl BatcherMetrics {
    fn snapshot(&self, capacity: usize) -> MetricsSnapshot {
        let depth = self.queue_depth.load(Ordering::Relaxed);
        let flushes = self.flush_count.load(Ordering::Relaxed);
        MetricsSnapshot {
            queue_depth: depth,
            queue_capacity: capacity,
            queue_utilization: if capacity > 0 {
                depth as f64 / capacity as f64
            } else {
                0.0
            },
            queue_full: self.queue_full.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            flush_count: flushes,
            avg_flush_latency_us: {
                let total = self.flush_latency_us.load(Ordering::Relaxed);
                if flushes > 0 {
                    total / flushes
                } else {
                    0
                }
            },
            max_batch_size: self.max_batch.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queue_depth: u64,
    pub queue_capacity: usize,
    pub queue_utilization: f64,
    pub queue_full: u64,
    pub records_written: u64,
    pub write_errors: u64,
    pub timed_out: u64,
    pub flush_count: u64,
    pub avg_flush_latency_us: u64,
    pub max_batch_size: u64,
}

/// One-shot latch the writer thread trips when it exits, so shutdown can
/// wait with a timeout instead of joining blindly.
pub(crate) struct CompletionSignal {
    done: Mutex<bool>,
    cv: Condvar,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = true;
        self.cv.notify_all();
    }

    /// Returns true if completion arrived within the timeout.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        if *done {
            return true;
        }
        let (done, _timeout) = self
            .cv
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *done
    }
}

/// The write engine. `submit` never blocks beyond the micro-enqueue;
/// `close` drains and stops the writer thread.
pub struct Batcher {
    tx: Option<SyncSender<Command>>,
    closed: Arc<AtomicBool>,
    metrics: Arc<BatcherMetrics>,
    completion: Arc<CompletionSignal>,
    writer_handle: Option<JoinHandle<()>>,
    capacity: usize,
}

impl Batcher {
    /// Spawn the dedicated writer thread against `store`.
    pub fn new(store: Arc<Store>, config: BatcherConfig) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Command>(config.queue_size);
        let metrics = Arc::new(BatcherMetrics::default());
        let completion = Arc::new(CompletionSignal::new());
        let capacity = config.queue_size;

        let writer_metrics = metrics.clone();
        let writer_completion = completion.clone();
        let writer_handle = thread::Builder::new()
            .name("log-writer".into())
            .spawn(move || {
                writer_loop(rx, store, config, writer_metrics);
                writer_completion.complete();
            })?;

        Ok(Self {
            tx: Some(tx),
            closed: Arc::new(AtomicBool::new(false)),
            metrics,
            completion,
            writer_handle: Some(writer_handle),
            capacity,
        })
    }

    /// Enqueue one record for durable commit. Returns the future that
    /// resolves to the assigned id, or fails fast with `QueueFull` /
    /// `ShuttingDown` without waiting.
    pub fn submit(&self, record: LogRecord) -> Result<oneshot::Receiver<WriteResult>, WriteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriteError::ShuttingDown);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(WriteError::ShuttingDown);
        };

        let (done, result) = oneshot::channel();
        match tx.try_send(Command::Write(WriteRequest { record, done })) {
            Ok(()) => {
                self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.queue_full.fetch_add(1, Ordering::Relaxed);
                Err(WriteError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(WriteError::ShuttingDown),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.capacity)
    }

    /// Stop accepting writes, drain what is queued, and stop the writer
    /// thread. Requests still queued when `drain_deadline` elapses fail
    /// with `ShuttingDown`.
    pub fn close(&mut self, drain_deadline: Duration) {
        self.closed.store(true, Ordering::Release);
        if let Some(tx) = self.tx.take() {
            let deadline = Instant::now() + drain_deadline;
            // A full queue means the drain has plenty to do; dropping the
            // sender below still terminates the writer once it empties.
            let _ = tx.try_send(Command::Shutdown { deadline });
        }
        if !self.completion.wait(drain_deadline + Duration::from_secs(5)) {
            tracing::warn!(
                "batcher writer thread did not finish within {:?} of the drain deadline",
                drain_deadline
            );
            return; // leave the thread to Drop
        }
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the sender lets the writer drain the queue and exit
        drop(self.tx.take());
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
    }
}

fn writer_loop(
    rx: Receiver<Command>,
    store: Arc<Store>,
    config: BatcherConfig,
    metrics: Arc<BatcherMetrics>,
) {
    let mut buffer: Vec<WriteRequest> = Vec::with_capacity(config.batch_size);
    let mut flush_deadline: Option<Instant> = None;
    let mut last_cleanup = Instant::now();

    loop {
        let timeout = flush_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(config.batch_timeout);

        match rx.recv_timeout(timeout) {
            Ok(Command::Write(request)) => {
                metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                if buffer.is_empty() {
                    flush_deadline = Some(Instant::now() + config.batch_timeout);
                }
                buffer.push(request);

                // Drain whatever queued up behind it without blocking
                while buffer.len() < config.batch_size {
                    match rx.try_recv() {
                        Ok(Command::Write(request)) => {
                            metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            buffer.push(request);
                        }
                        Ok(Command::Shutdown { deadline }) => {
                            flush(&store, &mut buffer, &config, &metrics);
                            shutdown_drain(&rx, &store, &config, &metrics, deadline);
                            return;
                        }
                        Err(_) => break,
                    }
                }

                let deadline_hit = flush_deadline.is_some_and(|d| Instant::now() >= d);
                if buffer.len() >= config.batch_size || deadline_hit {
                    flush(&store, &mut buffer, &config, &metrics);
                    flush_deadline = None;
                }
            }
            Ok(Command::Shutdown { deadline }) => {
                flush(&store, &mut buffer, &config, &metrics);
                shutdown_drain(&rx, &store, &config, &metrics, deadline);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                if buffer.is_empty() {
                    maybe_cleanup(&store, &config, &mut last_cleanup);
                } else {
                    flush(&store, &mut buffer, &config, &metrics);
                    flush_deadline = None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // All senders gone: final flush, then exit
                flush(&store, &mut buffer, &config, &metrics);
                tracing::debug!("batcher writer thread shutting down");
                return;
            }
        }
    }
}

/// Drain the queue after a shutdown command. Requests that fit within
/// the deadline are committed; the rest fail with `ShuttingDown`.
fn shutdown_drain(
    rx: &Receiver<Command>,
    store: &Store,
    config: &BatcherConfig,
    metrics: &BatcherMetrics,
    deadline: Instant,
) {
    let mut buffer: Vec<WriteRequest> = Vec::with_capacity(config.batch_size);
    loop {
        match rx.try_recv() {
            Ok(Command::Write(request)) => {
                metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                if Instant::now() >= deadline {
                    metrics.timed_out.fetch_add(1, Ordering::Relaxed);
                    let _ = request.done.send(Err(WriteError::ShuttingDown));
                } else {
                    buffer.push(request);
                    if buffer.len() >= config.batch_size {
                        flush(store, &mut buffer, config, metrics);
                    }
                }
            }
            Ok(Command::Shutdown { .. }) => {}
            Err(_) => break,
        }
    }
    if Instant::now() >= deadline {
        for request in buffer.drain(..) {
            metrics.timed_out.fetch_add(1, Ordering::Relaxed);
            let _ = request.done.send(Err(WriteError::ShuttingDown));
        }
    } else {
        flush(store, &mut buffer, config, metrics);
    }
    tracing::debug!("batcher drain complete");
}

fn flush(
    store: &Store,
    buffer: &mut Vec<WriteRequest>,
    config: &BatcherConfig,
    metrics: &BatcherMetrics,
) {
    if buffer.is_empty() {
        return;
    }
    let start = Instant::now();
    let count = buffer.len() as u64;
    let batch = std::mem::take(buffer);
    commit(store, batch, config, metrics);

    let latency = start.elapsed().as_micros() as u64;
    metrics.flush_count.fetch_add(1, Ordering::Relaxed);
    metrics.flush_latency_us.fetch_add(latency, Ordering::Relaxed);
    metrics.max_batch.fetch_max(count, Ordering::Relaxed);
    tracing::trace!("flushed {} records in {}µs", count, latency);
}

/// Commit one batch, running the retry/split/prefix-suffix ladder.
/// Every request in `batch` receives exactly one completion.
fn commit(
    store: &Store,
    mut batch: Vec<WriteRequest>,
    config: &BatcherConfig,
    metrics: &BatcherMetrics,
) {
    if batch.is_empty() {
        return;
    }
    let mut attempt = 0u32;
    loop {
        match store.insert_batch(batch.iter().map(|r| &r.record)) {
            Ok(ids) => {
                metrics
                    .records_written
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                for (request, id) in batch.into_iter().zip(ids) {
                    let _ = request.done.send(Ok(id));
                }
                return;
            }
            Err(StoreError::Retryable(message)) => {
                if attempt < config.max_retries {
                    let delay = config.retry_base_delay * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "retryable store error (attempt {}/{}): {}",
                        attempt,
                        config.max_retries,
                        message
                    );
                    thread::sleep(delay);
                    continue;
                }
                if batch.len() > 1 {
                    // Isolate the failure: halve and recurse
                    tracing::warn!(
                        "batch of {} still failing after {} attempts, splitting",
                        batch.len(),
                        attempt
                    );
                    let right = batch.split_off(batch.len() / 2);
                    commit(store, batch, config, metrics);
                    commit(store, right, config, metrics);
                } else if let Some(request) = batch.pop() {
                    metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                    let _ = request.done.send(Err(WriteError::Store(message)));
                }
                return;
            }
            Err(StoreError::Permanent { index, message }) => {
                // Commit around the poisoned row, fail only that one
                metrics.write_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!("permanent store error at batch row {}: {}", index, message);
                let suffix = batch.split_off((index + 1).min(batch.len()));
                let bad = batch.pop();
                commit(store, batch, config, metrics);
                if let Some(bad) = bad {
                    let _ = bad.done.send(Err(WriteError::Store(message)));
                }
                commit(store, suffix, config, metrics);
                return;
            }
            Err(other) => {
                let message = other.to_string();
                metrics
                    .write_errors
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                tracing::error!("unexpected store error, failing batch: {}", message);
                for request in batch {
                    let _ = request.done.send(Err(WriteError::Store(message.clone())));
                }
                return;
            }
        }
    }
}

fn maybe_cleanup(store: &Store, config: &BatcherConfig, last_cleanup: &mut Instant) {
    if config.retention_days == 0 || last_cleanup.elapsed() < config.cleanup_interval {
        return;
    }
    *last_cleanup = Instant::now();
    if let Err(e) = store.cleanup(config.retention_days) {
        // Non-fatal: the next interval tries again
        tracing::warn!("retention cleanup failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::store::StoreOptions;

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(Store::open(dir.path().join("logs.db"), StoreOptions::default()).unwrap());
        (dir, store)
    }

    fn record(i: usize) -> LogRecord {
        parser::parse(&format!(
            "<165>1 2023-10-15T14:30:45Z host app 1 - - message {i}"
        ))
        .unwrap()
    }

    fn quick_config() -> BatcherConfig {
        BatcherConfig {
            batch_timeout: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_commits_and_returns_id() {
        let (_dir, store) = open_store();
        let batcher = Batcher::new(store.clone(), quick_config()).unwrap();

        let id = batcher.submit(record(0)).unwrap().await.unwrap().unwrap();
        assert!(id > 0);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_single_producer_ids_strictly_increase() {
        let (_dir, store) = open_store();
        let batcher = Batcher::new(store, quick_config()).unwrap();

        let mut results = Vec::new();
        for i in 0..50 {
            results.push(batcher.submit(record(i)).unwrap());
        }
        let mut last = 0;
        for result in results {
            let id = result.await.unwrap().unwrap();
            assert!(id > last, "ids must increase in submission order");
            last = id;
        }
    }

    #[tokio::test]
    async fn test_queue_full_backpressure_and_recovery() {
        let (_dir, store) = open_store();
        let config = BatcherConfig {
            queue_size: 2,
            batch_size: 1,
            batch_timeout: Duration::from_millis(1),
            ..Default::default()
        };
        let batcher = Batcher::new(store.clone(), config).unwrap();

        // Stall the flush so the queue backs up behind it
        let guard = store.block_writes_for_test();

        let mut pending = Vec::new();
        let mut saw_queue_full = false;
        for i in 0..10 {
            match batcher.submit(record(i)) {
                Ok(rx) => pending.push(rx),
                Err(WriteError::QueueFull) => {
                    saw_queue_full = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_queue_full, "a bounded queue must eventually refuse");
        let snapshot = batcher.metrics();
        assert_eq!(snapshot.queue_depth, 2, "depth gauge equals capacity");
        assert!(snapshot.queue_full >= 1);

        // Release the store: everything queued commits, and submit works again
        drop(guard);
        for rx in pending {
            rx.await.unwrap().unwrap();
        }
        batcher.submit(record(99)).unwrap().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_rejects() {
        let (_dir, store) = open_store();
        let config = BatcherConfig {
            // Long timeout: drain must not depend on the flush timer
            batch_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let mut batcher = Batcher::new(store.clone(), config).unwrap();

        let pending: Vec<_> = (0..5).map(|i| batcher.submit(record(i)).unwrap()).collect();
        batcher.close(Duration::from_secs(5));

        for rx in pending {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(store.count().unwrap(), 5);

        match batcher.submit(record(6)) {
            Err(WriteError::ShuttingDown) => {}
            other => panic!("expected ShuttingDown, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_only_that_row() {
        let (_dir, store) = open_store();
        let batcher = Batcher::new(store.clone(), quick_config()).unwrap();

        let mut bad = record(1);
        bad.priority = 200; // violates the store's CHECK constraint

        let a = batcher.submit(record(0)).unwrap();
        let b = batcher.submit(bad).unwrap();
        let c = batcher.submit(record(2)).unwrap();

        assert!(a.await.unwrap().is_ok());
        match b.await.unwrap() {
            Err(WriteError::Store(_)) => {}
            other => panic!("expected store error for the bad row, got {other:?}"),
        }
        assert!(c.await.unwrap().is_ok());
        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(batcher.metrics().write_errors, 1);
    }

    #[tokio::test]
    async fn test_crash_leaves_exactly_the_committed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("logs.db");

        let committed: Vec<i64>;
        {
            let store = Arc::new(Store::open(&db, StoreOptions::default()).unwrap());
            let batcher = Batcher::new(store.clone(), quick_config()).unwrap();

            // A prefix makes it to disk
            let mut ids = Vec::new();
            for i in 0..5 {
                ids.push(batcher.submit(record(i)).unwrap().await.unwrap().unwrap());
            }
            committed = ids;

            // Stall the write path, then leave requests in flight
            let guard = store.block_writes_for_test();
            let inflight: Vec<_> = (5..10).map(|i| batcher.submit(record(i)).unwrap()).collect();

            // Simulate the process dying mid-flush: no close(), no drain.
            // Forgetting the engine and the lock abandons the writer
            // thread exactly where a crash would have left it.
            std::mem::forget(batcher);
            std::mem::forget(guard);
            drop(inflight);
        }

        // Restart: only the committed prefix is visible
        let store = Store::open(&db, StoreOptions::default()).unwrap();
        assert_eq!(store.count().unwrap(), committed.len() as i64);

        let mut ids: Vec<i64> = store
            .get_recent(100)
            .unwrap()
            .iter()
            .filter_map(|r| r.id)
            .collect();
        ids.reverse(); // get_recent is newest first
        assert_eq!(ids, committed);

        // Ids never regress across the restart
        let next = store.insert_batch(&vec![record(99)]).unwrap();
        assert!(next[0] > *committed.last().unwrap());
    }

    #[tokio::test]
    async fn test_metrics_track_flushes() {
        let (_dir, store) = open_store();
        let batcher = Batcher::new(store, quick_config()).unwrap();

        let pending: Vec<_> = (0..10).map(|i| batcher.submit(record(i)).unwrap()).collect();
        for rx in pending {
            rx.await.unwrap().unwrap();
        }
        let snapshot = batcher.metrics();
        assert_eq!(snapshot.records_written, 10);
        assert!(snapshot.flush_count >= 1);
        assert!(snapshot.max_batch_size >= 1);
        assert_eq!(snapshot.queue_depth, 0);
    }
}
