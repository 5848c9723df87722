//! One serial worker per distributor wallet.
//!
//! Batches are handed to the worker over a bounded channel and processed one
//! at a time; a failed batch is retried in place, ahead of anything that
//! arrived later. `quit` stops the worker after its current batch and
//! discards the rest.

use crate::config::DispatcherConfig;
use crate::gateway::BlockchainGateway;
use crate::sender::{BatchSender, SendError};
use crate::settings::SettingsStore;
use crate::types::{Batch, Credential};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// Cooperative stop signal shared by a worker and the code it runs.
///
/// Every pause in the pipeline goes through [`Shutdown::sleep`], so a stop
/// request interrupts back-offs instead of waiting them out.
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Completes once a stop has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent request
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `pause` unless a stop arrives first. Returns false when
    /// interrupted or already stopped.
    pub async fn sleep(&self, pause: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return false;
        }
        tokio::select! {
            _ = notified => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }
}

/// A queue that is no longer accepting work. Carries the rejected batch back
/// so the caller can restore it.
#[derive(Debug, Error)]
#[error("distributor queue {id} is closed")]
pub struct QueueClosed {
    pub id: u32,
    pub batch: Batch,
}

/// Serial work queue bound to one distributor wallet.
pub struct DistributorQueue {
    id: u32,
    tx: mpsc::Sender<Batch>,
    /// Queued plus in-flight batches; what admission load-balances on.
    depth: Arc<AtomicUsize>,
    shutdown: Arc<Shutdown>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DistributorQueue {
    /// Creates the queue and starts its worker task.
    pub fn spawn<G, S>(
        id: u32,
        credential: Credential,
        sender: Arc<BatchSender<G, S>>,
        cfg: Arc<DispatcherConfig>,
    ) -> Arc<Self>
    where
        G: BlockchainGateway,
        S: SettingsStore,
    {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity);
        let shutdown = Arc::new(Shutdown::default());
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(worker_loop(
            id,
            credential,
            rx,
            sender,
            cfg,
            shutdown.clone(),
            depth.clone(),
        ));
        Arc::new(Self {
            id,
            tx,
            depth,
            shutdown,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queued plus in-flight batches.
    pub fn size(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        !self.shutdown.is_requested()
    }

    /// Appends a batch. Blocks while the queue is at capacity; fails once
    /// the queue has been told to quit.
    pub async fn enqueue(&self, batch: Batch) -> Result<(), QueueClosed> {
        debug_assert!(!batch.ops.is_empty());
        if self.shutdown.is_requested() {
            return Err(QueueClosed { id: self.id, batch });
        }
        self.depth.fetch_add(1, Ordering::SeqCst);
        match self.tx.send(batch).await {
            Ok(()) => Ok(()),
            Err(rejected) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Err(QueueClosed {
                    id: self.id,
                    batch: rejected.0,
                })
            }
        }
    }

    /// Asks the worker to stop after its current batch. Queued batches are
    /// discarded, not drained.
    pub fn quit(&self) {
        tracing::debug!(queue = self.id, "queue quitting");
        self.shutdown.request();
    }

    /// Waits for the worker task to finish.
    pub async fn join(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(queue = self.id, error = %err, "queue worker task failed");
            }
        }
    }
}

async fn worker_loop<G, S>(
    id: u32,
    credential: Credential,
    mut rx: mpsc::Receiver<Batch>,
    sender: Arc<BatchSender<G, S>>,
    cfg: Arc<DispatcherConfig>,
    shutdown: Arc<Shutdown>,
    depth: Arc<AtomicUsize>,
) where
    G: BlockchainGateway,
    S: SettingsStore,
{
    tracing::debug!(queue = id, distributor = %credential.public(), "queue worker started");

    loop {
        let mut batch = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            received = rx.recv() => match received {
                Some(batch) => batch,
                None => break,
            },
        };

        // Short pause so a burst of arrivals clusters into adjacent work
        // instead of interleaving with it.
        if !shutdown.sleep(cfg.idle_gap).await {
            tracing::warn!(queue = id, tag = %batch.tag, ops = batch.ops.len(), "stopped before batch started; discarding");
            depth.fetch_sub(1, Ordering::SeqCst);
            break;
        }

        'batch: loop {
            match sender
                .send(
                    &credential,
                    &mut batch.ops,
                    batch.memo.as_deref(),
                    &batch.issuers,
                    &batch.tag,
                    &shutdown,
                )
                .await
            {
                Ok(stats) => {
                    tracing::info!(queue = id, tag = %batch.tag, ?stats, "batch complete");
                    break 'batch;
                }
                Err(SendError::Cancelled) => {
                    tracing::warn!(
                        queue = id,
                        tag = %batch.tag,
                        ops = batch.ops.len(),
                        "stopped while sending; discarding batch"
                    );
                    break 'batch;
                }
                Err(err) => {
                    batch.retry_count += 1;
                    if batch.retry_count >= cfg.max_item_retries {
                        tracing::error!(
                            queue = id,
                            tag = %batch.tag,
                            retries = batch.retry_count,
                            ops = batch.ops.len(),
                            error = %err,
                            "batch permanently failed; dropping"
                        );
                        break 'batch;
                    }
                    tracing::warn!(
                        queue = id,
                        tag = %batch.tag,
                        retry = batch.retry_count,
                        error = %err,
                        "batch failed; retrying ahead of newer work"
                    );
                    if !shutdown.sleep(cfg.requeue_pause).await {
                        tracing::warn!(
                            queue = id,
                            tag = %batch.tag,
                            ops = batch.ops.len(),
                            "stopped during retry pause; discarding batch"
                        );
                        break 'batch;
                    }
                }
            }
        }
        depth.fetch_sub(1, Ordering::SeqCst);
    }

    // Whatever is still queued is discarded, with a count for the log.
    rx.close();
    let mut discarded = 0usize;
    while rx.try_recv().is_ok() {
        depth.fetch_sub(1, Ordering::SeqCst);
        discarded += 1;
    }
    if discarded > 0 {
        tracing::warn!(queue = id, discarded, "queue stopped with undrained batches");
    }
    tracing::debug!(queue = id, "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayError;
    use crate::testutil::{cred, op, MockGateway, MockSettings};
    use std::time::Duration;

    fn batch(tag: &str, destination: &str) -> Batch {
        Batch {
            ops: vec![op(destination, 100)],
            memo: None,
            issuers: Vec::new(),
            tag: tag.to_string(),
            retry_count: 0,
        }
    }

    fn queue_with(
        gateway: Arc<MockGateway>,
        settings: Arc<MockSettings>,
        cfg: DispatcherConfig,
    ) -> Arc<DistributorQueue> {
        let cfg = Arc::new(cfg);
        let sender = Arc::new(BatchSender::new(gateway, settings, cfg.clone()));
        DistributorQueue::spawn(7, cred("DIST"), sender, cfg)
    }

    async fn drained(queue: &DistributorQueue) {
        for _ in 0..1_000 {
            if queue.size() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("queue did not drain: size={}", queue.size());
    }

    #[tokio::test(start_paused = true)]
    async fn processes_batches_in_fifo_order() {
        let gateway = Arc::new(MockGateway::new());
        let settings = Arc::new(MockSettings::new());
        let queue = queue_with(gateway.clone(), settings, DispatcherConfig::default());

        queue.enqueue(batch("a", "GDESTA")).await.unwrap();
        queue.enqueue(batch("b", "GDESTB")).await.unwrap();
        drained(&queue).await;

        let destinations: Vec<String> = gateway
            .send_many_log()
            .into_iter()
            .map(|(_, ops, _)| ops[0].destination.clone())
            .collect();
        assert_eq!(destinations, vec!["GDESTA", "GDESTB"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_retries_ahead_of_newer_work() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_send_many_err(GatewayError::Transport {
            status: 503,
            message: "busy".into(),
        });
        let settings = Arc::new(MockSettings::new());
        let cfg = DispatcherConfig {
            // One transport failure fails the send outright, so the retry
            // happens at the batch level.
            max_transient_retries: 0,
            ..Default::default()
        };
        let queue = queue_with(gateway.clone(), settings, cfg);

        queue.enqueue(batch("a", "GDESTA")).await.unwrap();
        queue.enqueue(batch("b", "GDESTB")).await.unwrap();
        drained(&queue).await;

        let destinations: Vec<String> = gateway
            .send_many_log()
            .into_iter()
            .map(|(_, ops, _)| ops[0].destination.clone())
            .collect();
        assert_eq!(destinations, vec!["GDESTA", "GDESTA", "GDESTB"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_is_dropped_after_retry_budget() {
        let gateway = Arc::new(MockGateway::new());
        for _ in 0..2 {
            gateway.script_send_many_err(GatewayError::Transport {
                status: 503,
                message: "busy".into(),
            });
        }
        let settings = Arc::new(MockSettings::new());
        let cfg = DispatcherConfig {
            max_transient_retries: 0,
            max_item_retries: 2,
            ..Default::default()
        };
        let queue = queue_with(gateway.clone(), settings, cfg);

        queue.enqueue(batch("doomed", "GDEST")).await.unwrap();
        drained(&queue).await;

        assert_eq!(gateway.send_many_calls(), 2);
        // The queue itself stays healthy.
        assert!(queue.is_active());
        queue.enqueue(batch("next", "GNEXT")).await.unwrap();
        drained(&queue).await;
        assert_eq!(gateway.send_many_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_discards_queued_batches() {
        let gateway = Arc::new(MockGateway::new());
        let settings = Arc::new(MockSettings::new());
        // Park the worker on the kill switch so nothing is submitted.
        settings.set_enabled(false);
        let queue = queue_with(gateway.clone(), settings, DispatcherConfig::default());

        for i in 0..3 {
            queue.enqueue(batch("t", &format!("GDEST{i}"))).await.unwrap();
        }
        queue.quit();
        queue.join().await;

        assert_eq!(gateway.send_many_calls(), 0);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_fails_after_quit() {
        let gateway = Arc::new(MockGateway::new());
        let settings = Arc::new(MockSettings::new());
        let queue = queue_with(gateway, settings, DispatcherConfig::default());

        queue.quit();
        queue.join().await;

        assert!(!queue.is_active());
        let err = queue.enqueue(batch("late", "GDEST")).await.unwrap_err();
        assert_eq!(err.id, 7);
        assert_eq!(err.batch.ops.len(), 1);
    }
}
