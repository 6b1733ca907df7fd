// Asynchronous replication queue
// Producers enqueue without blocking. A background flusher drains the queue
// when it reaches the batch size or when the oldest event has waited a full
// interval, whichever comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics;
use crate::model::{MutationEvent, ReplicationBatch};

/// Receiver of flushed batches
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn transmit(&self, batch: ReplicationBatch);
}

#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Longest time an event waits before a flush
    pub flush_interval: Duration,
    /// Largest batch handed to the sink; reaching it triggers an immediate flush
    pub max_batch_size: usize,
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
            max_batch_size: 1000,
        }
    }
}

#[derive(Default)]
struct Pending {
    events: Vec<MutationEvent>,
    oldest: Option<Instant>,
}

struct QueueState {
    cache_name: String,
    pending: Mutex<Pending>,
    wakeup: Notify,
    closed: AtomicBool,
}

impl QueueState {
    fn snapshot(&self) -> (usize, Option<Instant>) {
        let pending = self.pending.lock();
        (pending.events.len(), pending.oldest)
    }

    fn take(&self) -> Vec<MutationEvent> {
        let mut pending = self.pending.lock();
        pending.oldest = None;
        std::mem::take(&mut pending.events)
    }

    /// Take up to `max` events from the front. Leftovers keep the old
    /// timestamp so they become due immediately.
    fn take_batch(&self, max: usize) -> Vec<MutationEvent> {
        let mut pending = self.pending.lock();
        if pending.events.len() <= max {
            pending.oldest = None;
            return std::mem::take(&mut pending.events);
        }
        pending.events.drain(..max).collect()
    }
}

/// Per-cache queue with its own flusher task
pub struct BatchQueue {
    state: Arc<QueueState>,
    shutdown_tx: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchQueue {
    /// Create the queue and spawn its flusher on the current runtime
    pub fn start(
        cache_name: impl Into<String>,
        config: BatchQueueConfig,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let state = Arc::new(QueueState {
            cache_name: cache_name.into(),
            pending: Mutex::new(Pending::default()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flusher = tokio::spawn(run_flusher(state.clone(), config, sink, shutdown_rx));

        Self {
            state,
            shutdown_tx,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.state.cache_name
    }

    /// Enqueue an event. Never waits on the network.
    ///
    /// Returns false if the queue has been shut down.
    pub fn push(&self, event: MutationEvent) -> bool {
        if self.state.closed.load(Ordering::Acquire) {
            debug!(
                "Replication queue for {} is closed, dropping {} event",
                self.state.cache_name, event.kind
            );
            return false;
        }

        let size = {
            let mut pending = self.state.pending.lock();
            if pending.oldest.is_none() {
                pending.oldest = Some(Instant::now());
            }
            pending.events.push(event);
            pending.events.len()
        };

        metrics::set_replication_queue_size(&self.state.cache_name, size);
        self.state.wakeup.notify_one();
        true
    }

    /// Number of events waiting for a flush
    pub fn pending(&self) -> usize {
        self.state.pending.lock().events.len()
    }

    /// Stop accepting events and give the flusher `grace` to drain.
    ///
    /// Returns the number of events discarded because the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.state.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        let Some(mut flusher) = self.flusher.lock().take() else {
            return 0;
        };

        match tokio::time::timeout(grace, &mut flusher).await {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                warn!(
                    "Replication flusher for {} failed: {}",
                    self.state.cache_name, e
                );
                self.discard()
            }
            Err(_) => {
                flusher.abort();
                let discarded = self.discard();
                warn!(
                    "Replication queue for {} did not drain within {:?}, discarded {} events",
                    self.state.cache_name, grace, discarded
                );
                discarded
            }
        }
    }

    fn discard(&self) -> usize {
        let discarded = self.state.take().len();
        metrics::set_replication_queue_size(&self.state.cache_name, 0);
        discarded
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.abort();
        }
    }
}

async fn run_flusher(
    state: Arc<QueueState>,
    config: BatchQueueConfig,
    sink: Arc<dyn BatchSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let max_batch_size = config.max_batch_size.max(1);

    loop {
        let (size, oldest) = state.snapshot();
        if size >= max_batch_size {
            flush(&state, max_batch_size, sink.as_ref()).await;
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = state.wakeup.notified() => {}
            _ = sleep_until_due(oldest, config.flush_interval) => {
                flush(&state, max_batch_size, sink.as_ref()).await;
            }
        }
    }

    // Final drain on shutdown
    while flush(&state, max_batch_size, sink.as_ref()).await {}
    debug!("Replication flusher for {} stopped", state.cache_name);
}

async fn sleep_until_due(oldest: Option<Instant>, flush_interval: Duration) {
    match oldest {
        Some(oldest) => tokio::time::sleep_until(oldest + flush_interval).await,
        None => std::future::pending().await,
    }
}

/// Hand one batch to the sink. Returns false if there was nothing to send.
async fn flush(state: &QueueState, max_batch_size: usize, sink: &dyn BatchSink) -> bool {
    let events = state.take_batch(max_batch_size);
    if events.is_empty() {
        return false;
    }
    metrics::set_replication_queue_size(&state.cache_name, state.pending.lock().events.len());

    let timer = metrics::Timer::new();
    sink.transmit(ReplicationBatch::new(state.cache_name.clone(), events))
        .await;
    metrics::record_flush_duration(&state.cache_name, timer.elapsed_secs());
    true
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::model::Element;

    struct ChannelSink {
        tx: mpsc::UnboundedSender<ReplicationBatch>,
    }

    #[async_trait]
    impl BatchSink for ChannelSink {
        async fn transmit(&self, batch: ReplicationBatch) {
            let _ = self.tx.send(batch);
        }
    }

    struct SlowSink {
        delay: Duration,
    }

    #[async_trait]
    impl BatchSink for SlowSink {
        async fn transmit(&self, _batch: ReplicationBatch) {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn queue(
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> (BatchQueue, mpsc::UnboundedReceiver<ReplicationBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = BatchQueue::start(
            "c1",
            BatchQueueConfig {
                flush_interval,
                max_batch_size,
            },
            Arc::new(ChannelSink { tx }),
        );
        (queue, rx)
    }

    fn put(key: &str, value: &str) -> MutationEvent {
        MutationEvent::put("c1", Element::new(key, value.as_bytes().to_vec()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let (queue, mut rx) = queue(Duration::from_secs(60), 3);
        for i in 0..3 {
            assert!(queue.push(put(&format!("k{}", i), "v")));
        }

        let batch = tokio::time::timeout(Duration::from_millis(10), rx.recv())
            .await
            .expect("full batch should flush without waiting")
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_event_waits_for_interval() {
        let (queue, mut rx) = queue(Duration::from_millis(50), 100);
        queue.push(put("k", "v"));

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.pending(), 1);

        let batch = tokio::time::timeout(Duration::from_millis(5), rx.recv())
            .await
            .expect("event should flush once the interval elapses")
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_preserve_enqueue_order() {
        let (queue, mut rx) = queue(Duration::from_millis(50), 100);
        queue.push(put("k", "1"));
        queue.push(put("k", "2"));
        queue.push(MutationEvent::remove("c1", "other"));

        let batch = rx.recv().await.unwrap();
        let values: Vec<Option<Vec<u8>>> = batch
            .events
            .iter()
            .map(|e| e.element.as_ref().map(|el| el.value.clone()))
            .collect();
        assert_eq!(values, vec![Some(b"1".to_vec()), Some(b"2".to_vec()), None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_pending_events() {
        let (queue, mut rx) = queue(Duration::from_secs(60), 100);
        queue.push(put("a", "1"));
        queue.push(put("b", "2"));

        let discarded = queue.shutdown(Duration::from_secs(1)).await;
        assert_eq!(discarded, 0);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(!queue.push(put("c", "3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_after_grace() {
        let queue = BatchQueue::start(
            "c1",
            BatchQueueConfig {
                flush_interval: Duration::from_millis(10),
                max_batch_size: 1,
            },
            Arc::new(SlowSink {
                delay: Duration::from_secs(30),
            }),
        );
        for i in 0..5 {
            queue.push(put(&format!("k{}", i), "v"));
        }
        tokio::task::yield_now().await;

        let discarded = queue.shutdown(Duration::from_millis(100)).await;
        assert!(discarded > 0);
        assert_eq!(queue.pending(), 0);
    }
}
