//! Ingest service - orchestrates parser, fan-out, and the write engine
//!
//! One accepted line flows two ways at once: immediately to live
//! subscribers (before durable commit) and onto the batcher's queue for
//! the store. `process_line` returns after the enqueue; request/response
//! callers use `process_line_sync` to wait for the assigned id.

use crate::batcher::{Batcher, BatcherConfig, MetricsSnapshot, WriteError, WriteResult};
use crate::fanout::{Fanout, OverflowPolicy, Subscription};
use crate::parser::{self, ParseError};
use crate::record::LogRecord;
use crate::store::{SearchQuery, Store, StoreError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Ingest-side knobs; the write engine has its own config.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Reject invalid RFC5424 lines (true) or store them as lenient
    /// fallback records (false).
    pub strict_mode: bool,
    /// Per-line byte cap; longer lines are rejected without storage.
    pub max_line_length: usize,
    /// Per-subscriber delivery buffer.
    pub subscriber_buffer: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            strict_mode: true,
            max_line_length: 8192,
            subscriber_buffer: 256,
        }
    }
}

/// What `process_line` can fail with.
#[derive(Debug)]
pub enum IngestError {
    Parse(ParseError),
    Write(WriteError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Parse(e) => write!(f, "{e}"),
            IngestError::Write(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<ParseError> for IngestError {
    fn from(e: ParseError) -> Self {
        IngestError::Parse(e)
    }
}

impl From<WriteError> for IngestError {
    fn from(e: WriteError) -> Self {
        IngestError::Write(e)
    }
}

/// Counter snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IngestStats {
    /// Lines accepted (parsed, published, enqueued).
    pub processed: u64,
    /// Lines rejected (parse failure or over-length).
    pub failed: u64,
    /// Live subscriptions.
    pub subscribers: usize,
    /// Records dropped across all subscribers.
    pub fanout_dropped: u64,
    pub running: bool,
    /// Write engine metrics; absent before start / after stop.
    pub writer: Option<MetricsSnapshot>,
}

/// The pipeline core: owns the store, the fan-out registry, and (while
/// running) the batcher.
pub struct IngestService {
    config: IngestConfig,
    batcher_config: BatcherConfig,
    store: Arc<Store>,
    fanout: Fanout,
    batcher: Mutex<Option<Batcher>>,
    processed: AtomicU64,
    failed: AtomicU64,
    running: AtomicBool,
}

impl IngestService {
    pub fn new(store: Arc<Store>, config: IngestConfig, batcher_config: BatcherConfig) -> Self {
        let fanout = Fanout::new(config.subscriber_buffer);
        Self {
            config,
            batcher_config,
            store,
            fanout,
            batcher: Mutex::new(None),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Bring up the write engine. Idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut batcher = self.lock_batcher();
        if batcher.is_none() {
            *batcher = Some(Batcher::new(self.store.clone(), self.batcher_config.clone())?);
        }
        self.running.store(true, Ordering::Release);
        tracing::info!(
            "ingest service started (strict={}, queue={})",
            self.config.strict_mode,
            self.batcher_config.queue_size
        );
        Ok(())
    }

    /// Tear down: reject new work, drain the write queue (bounded by
    /// `drain_deadline`), then close every subscription.
    pub fn stop(&self, drain_deadline: Duration) {
        self.running.store(false, Ordering::Release);
        let batcher = self.lock_batcher().take();
        if let Some(mut batcher) = batcher {
            batcher.close(drain_deadline);
        }
        self.fanout.close_all();
        tracing::info!("ingest service stopped");
    }

    /// Parse, publish, enqueue. Returns once the record is on the write
    /// queue; the commit happens asynchronously.
    pub fn process_line(&self, raw: &str) -> Result<(), IngestError> {
        self.accept(raw).map(|_| ())
    }

    /// As `process_line`, but waits for the batched commit and returns
    /// the assigned id.
    pub async fn process_line_sync(&self, raw: &str) -> Result<i64, IngestError> {
        let result = self.accept(raw)?;
        match result.await {
            Ok(outcome) => outcome.map_err(IngestError::Write),
            Err(_) => Err(IngestError::Write(WriteError::Canceled)),
        }
    }

    fn accept(&self, raw: &str) -> Result<oneshot::Receiver<WriteResult>, IngestError> {
        if raw.len() > self.config.max_line_length {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(ParseError::line_too_long(raw.len(), self.config.max_line_length).into());
        }

        let record = match parser::parse(raw) {
            Ok(record) => record,
            Err(e) if self.config.strict_mode => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("rejected line: {e}");
                return Err(e.into());
            }
            Err(e) => {
                tracing::debug!("storing invalid line as lenient fallback: {e}");
                LogRecord::lenient(raw)
            }
        };

        // Live subscribers first: their latency must not depend on the
        // commit path. On a crash before flush they may have seen a
        // record the store never got.
        self.fanout.publish(&Arc::new(record.clone()));

        let result = {
            let batcher = self.lock_batcher();
            let Some(batcher) = batcher.as_ref() else {
                return Err(WriteError::ShuttingDown.into());
            };
            batcher.submit(record).map_err(IngestError::Write)?
        };
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Bookkeeping hook for the listener's framing layer, which rejects
    /// over-long lines before they ever reach `process_line`.
    pub fn note_rejected_line(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<LogRecord>, StoreError> {
        self.store.search(query)
    }

    pub fn get_recent(&self, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        self.store.get_recent(limit)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&self, policy: OverflowPolicy) -> Subscription {
        self.fanout.subscribe(policy)
    }

    /// Explicit detach. Stream consumers usually just drop their
    /// receiver and get evicted on the next dispatch pass.
    #[allow(dead_code)]
    pub fn unsubscribe(&self, id: u64) {
        self.fanout.unsubscribe(id);
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            subscribers: self.fanout.subscriber_count(),
            fanout_dropped: self.fanout.total_dropped(),
            running: self.running.load(Ordering::Acquire),
            writer: self.lock_batcher().as_ref().map(|b| b.metrics()),
        }
    }

    fn lock_batcher(&self) -> std::sync::MutexGuard<'_, Option<Batcher>> {
        self.batcher.lock().unwrap_or_else(|e| e.into_inner())
    }
}
