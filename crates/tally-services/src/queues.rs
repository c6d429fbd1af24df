//! Sync and event batching queues
//!
//! Both queues buffer work inside a fixed window and flush it in one
//! coalesced batch: sync items dedup by scope (the newest snapshot wins,
//! and flushing one set-to per scope replaces any number of pending ones),
//! events append-only. A full window or a full buffer flushes; closing the
//! queue drains whatever is pending before the worker exits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tally_core::config::QueueConfig;
use tally_core::models::{SyncItem, UsageEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Channel capacity before enqueues start dropping
const QUEUE_CAPACITY: usize = 8192;

/// Batching queue for cache-to-durable sync work
pub struct SyncQueue {
    tx: mpsc::Sender<SyncItem>,
    handle: JoinHandle<()>,
}

impl SyncQueue {
    /// Start the queue worker; `flush` receives each coalesced batch
    pub fn start<F, Fut>(config: QueueConfig, mut flush: F) -> Self
    where
        F: FnMut(Vec<SyncItem>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::channel::<SyncItem>(QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut pending: HashMap<_, SyncItem> = HashMap::new();
            let mut ticker = interval(Duration::from_millis(config.sync_window_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(item) => {
                            // newest snapshot per scope wins
                            pending.insert(item.dedup_key(), item);
                            if pending.len() >= config.sync_max_batch {
                                let batch: Vec<_> =
                                    pending.drain().map(|(_, v)| v).collect();
                                flush(batch).await;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            let batch: Vec<_> = pending.drain().map(|(_, v)| v).collect();
                            flush(batch).await;
                        }
                    }
                }
            }

            if !pending.is_empty() {
                info!(items = pending.len(), "Draining sync queue on shutdown");
                let batch: Vec<_> = pending.drain().map(|(_, v)| v).collect();
                flush(batch).await;
            }
        });

        Self { tx, handle }
    }

    /// Queue a sync item; never blocks the hot path
    ///
    /// A full buffer drops the item: the scope still converges through the
    /// next deduction's sync or cache expiry.
    pub fn enqueue(&self, item: SyncItem) {
        if self.tx.try_send(item).is_err() {
            warn!("Sync queue full; item dropped");
        }
    }

    /// Close the queue and wait for the worker to drain
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sync queue worker ended abnormally");
        }
    }
}

/// Batching queue for usage events recorded off the cache fast path
pub struct EventQueue {
    tx: mpsc::Sender<UsageEvent>,
    handle: JoinHandle<()>,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn start<F, Fut>(config: QueueConfig, mut flush: F) -> Self
    where
        F: FnMut(Vec<UsageEvent>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = mpsc::channel::<UsageEvent>(QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            let mut pending: Vec<UsageEvent> = Vec::new();
            let mut ticker = interval(Duration::from_millis(config.event_window_ms.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            pending.push(event);
                            if pending.len() >= config.event_max_batch {
                                flush(std::mem::take(&mut pending)).await;
                            }
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        if !pending.is_empty() {
                            flush(std::mem::take(&mut pending)).await;
                        }
                    }
                }
            }

            if !pending.is_empty() {
                info!(events = pending.len(), "Draining event queue on shutdown");
                flush(std::mem::take(&mut pending)).await;
            }
        });

        Self {
            tx,
            handle,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event; never blocks the hot path
    ///
    /// Audit events are lossy under sustained overload; the drop counter
    /// makes that loss visible instead of silent.
    pub fn enqueue(&self, event: UsageEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped_total = total, "Event queue full; event dropped");
        }
    }

    /// Events dropped on a full buffer since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Event queue worker ended abnormally");
        }
    }
}
