//! Live fan-out of accepted records to subscribers
//!
//! Delivery happens before durable commit, so the live stream's latency
//! is independent of disk latency. Subscribers therefore observe records
//! that, on a crash before flush, may never appear in the store; the
//! stream is a tail, not a source of truth.
//!
//! Each subscription owns a bounded channel. Delivery is `try_send`: a
//! subscriber that cannot keep up either loses that one record (its drop
//! counter increments) or, in strict mode, is disconnected. Either way
//! no subscriber can delay delivery to another.

use crate::record::LogRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What to do with a subscriber whose buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the record for this subscriber only and count it.
    #[default]
    DropNewest,
    /// Close the subscription; the consumer sees the stream end.
    Disconnect,
}

/// A live, ordered delivery channel of records for one consumer.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<LogRecord>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    #[allow(dead_code)] // The gateway reads the id via into_parts
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next record, or `None` once the subscription is closed.
    /// The gateway adapts the raw receiver instead; see `into_parts`.
    #[allow(dead_code)]
    pub async fn recv(&mut self) -> Option<Arc<LogRecord>> {
        self.rx.recv().await
    }

    /// Records dropped for this subscriber because its buffer was full.
    #[allow(dead_code)] // Surfaced per-subscriber in tests; totals go via Fanout
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Split into the id and the raw receiver, for stream adapters.
    pub fn into_parts(self) -> (u64, mpsc::Receiver<Arc<LogRecord>>) {
        (self.id, self.rx)
    }
}

struct SubscriberHandle {
    id: u64,
    tx: mpsc::Sender<Arc<LogRecord>>,
    dropped: Arc<AtomicU64>,
    policy: OverflowPolicy,
}

struct Registry {
    next_id: u64,
    subscribers: Vec<SubscriberHandle>,
}

/// Subscription registry. The mutex is held only to add/remove entries
/// and to snapshot the sender list before a dispatch pass; delivery
/// itself runs lock-free on the clones.
pub struct Fanout {
    buffer_size: usize,
    registry: Mutex<Registry>,
    total_dropped: AtomicU64,
}

impl Fanout {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            registry: Mutex::new(Registry {
                next_id: 1,
                subscribers: Vec::new(),
            }),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, policy: OverflowPolicy) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.push(SubscriberHandle {
            id,
            tx,
            dropped: dropped.clone(),
            policy,
        });
        tracing::debug!("subscriber {} attached ({} active)", id, registry.subscribers.len());
        Subscription { id, rx, dropped }
    }

    /// Idempotent: unknown ids are a no-op. Dropping the sender closes
    /// the consumer's stream cleanly.
    pub fn unsubscribe(&self, id: u64) {
        let mut registry = self.lock();
        let before = registry.subscribers.len();
        registry.subscribers.retain(|s| s.id != id);
        if registry.subscribers.len() != before {
            tracing::debug!("subscriber {} detached", id);
        }
    }

    /// Deliver one record to every live subscriber.
    pub fn publish(&self, record: &Arc<LogRecord>) {
        // Snapshot under the lock, deliver outside it
        let snapshot: Vec<(u64, mpsc::Sender<Arc<LogRecord>>, Arc<AtomicU64>, OverflowPolicy)> = {
            let registry = self.lock();
            registry
                .subscribers
                .iter()
                .map(|s| (s.id, s.tx.clone(), s.dropped.clone(), s.policy))
                .collect()
        };

        let mut evict: Vec<u64> = Vec::new();
        for (id, tx, dropped, policy) in snapshot {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => match policy {
                    OverflowPolicy::DropNewest => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    OverflowPolicy::Disconnect => {
                        tracing::debug!("subscriber {} too slow, disconnecting", id);
                        evict.push(id);
                    }
                },
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push(id),
            }
        }

        if !evict.is_empty() {
            let mut registry = self.lock();
            registry.subscribers.retain(|s| !evict.contains(&s.id));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Records dropped across all subscribers since startup.
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }

    /// Detach every subscriber; their streams end cleanly.
    pub fn close_all(&self) {
        let mut registry = self.lock();
        let count = registry.subscribers.len();
        registry.subscribers.clear();
        if count > 0 {
            tracing::debug!("closed {} subscriptions", count);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    fn record(i: usize) -> Arc<LogRecord> {
        Arc::new(
            parser::parse(&format!(
                "<13>1 2023-10-15T14:30:45Z host app - - - event {i}"
            ))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_publish_order() {
        let fanout = Fanout::new(16);
        let mut sub = fanout.subscribe(OverflowPolicy::DropNewest);

        for i in 0..5 {
            fanout.publish(&record(i));
        }
        for i in 0..5 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.message, format!("event {i}"));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_affecting_others() {
        let fanout = Fanout::new(2);
        let mut slow = fanout.subscribe(OverflowPolicy::DropNewest);
        let mut fast = fanout.subscribe(OverflowPolicy::DropNewest);

        // Neither is consuming; the 2-slot buffers overflow on the third
        for i in 0..5 {
            fanout.publish(&record(i));
        }

        assert_eq!(slow.dropped(), 3);
        assert_eq!(fast.dropped(), 3);
        assert_eq!(fanout.total_dropped(), 6);

        // Both still get the records that fit, in order
        assert_eq!(slow.recv().await.unwrap().message, "event 0");
        assert_eq!(fast.recv().await.unwrap().message, "event 0");
        assert_eq!(fanout.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_strict_subscriber_is_disconnected_on_overflow() {
        let fanout = Fanout::new(1);
        let mut strict = fanout.subscribe(OverflowPolicy::Disconnect);
        let mut tolerant = fanout.subscribe(OverflowPolicy::DropNewest);

        fanout.publish(&record(0));
        fanout.publish(&record(1)); // strict overflows here

        assert_eq!(fanout.subscriber_count(), 1);

        // The strict stream drains its buffer, then ends
        assert!(strict.recv().await.is_some());
        assert!(strict.recv().await.is_none());

        // The tolerant one just dropped the overflow
        assert_eq!(tolerant.dropped(), 1);
        assert!(tolerant.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_closes_stream() {
        let fanout = Fanout::new(4);
        let mut sub = fanout.subscribe(OverflowPolicy::DropNewest);
        let id = sub.id();

        fanout.unsubscribe(id);
        fanout.unsubscribe(id); // no-op
        assert_eq!(fanout.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_ends_every_stream() {
        let fanout = Fanout::new(4);
        let mut a = fanout.subscribe(OverflowPolicy::DropNewest);
        let mut b = fanout.subscribe(OverflowPolicy::Disconnect);

        fanout.publish(&record(0));
        fanout.close_all();

        assert_eq!(fanout.subscriber_count(), 0);
        // Buffered records drain before the close is observed
        assert!(a.recv().await.is_some());
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_some());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_consumer_gone_evicts() {
        let fanout = Fanout::new(4);
        let sub = fanout.subscribe(OverflowPolicy::DropNewest);
        drop(sub);

        fanout.publish(&record(0));
        assert_eq!(fanout.subscriber_count(), 0);
    }
}
