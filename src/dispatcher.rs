//! Fleet management and admission.
//!
//! The dispatcher owns one [`DistributorQueue`] per distributor wallet,
//! chunks submitted operations into bounded batches, admits each batch to
//! the least-loaded queue, and keeps the fleet in sync with the upstream
//! directory on a fixed interval.

use crate::config::{ConfigError, DispatcherConfig};
use crate::gateway::BlockchainGateway;
use crate::queue::{DistributorQueue, Shutdown};
use crate::sender::BatchSender;
use crate::settings::{DistributorSource, SettingsStore};
use crate::types::{Batch, Credential, DistributorRecord, Operation};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// What `submit` can fail with. Everything downstream of admission is
/// handled inside the queues and never surfaces here.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The fleet is empty.
    #[error("no distributor queues available")]
    NoDistributorsAvailable,
    /// A queue refused a batch. Its operations were returned to the head of
    /// the pending buffer, so a retry re-admits them in the original order.
    #[error("distributor queue {queue} refused the batch")]
    AdmissionFailed { queue: u32 },
}

struct FleetState {
    queues: HashMap<u32, Arc<DistributorQueue>>,
    pending: VecDeque<Operation>,
    issuers: Vec<Credential>,
}

struct DispatcherInner<G, S> {
    sender: Arc<BatchSender<G, S>>,
    settings: Arc<S>,
    cfg: Arc<DispatcherConfig>,
    /// Admission lock, held for the whole `submit` body and for every fleet
    /// mutation.
    state: Mutex<FleetState>,
}

pub struct Dispatcher<G, S, D> {
    inner: Arc<DispatcherInner<G, S>>,
    directory: Arc<D>,
    refresh_stop: Arc<Shutdown>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<G, S, D> Dispatcher<G, S, D>
where
    G: BlockchainGateway,
    S: SettingsStore,
    D: DistributorSource,
{
    /// Builds the dispatcher, loads the initial fleet from the directory,
    /// and starts the periodic refresh task.
    pub async fn new(
        gateway: Arc<G>,
        settings: Arc<S>,
        directory: Arc<D>,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cfg = Arc::new(config);
        let sender = Arc::new(BatchSender::new(gateway, settings.clone(), cfg.clone()));
        let inner = Arc::new(DispatcherInner {
            sender,
            settings,
            cfg,
            state: Mutex::new(FleetState {
                queues: HashMap::new(),
                pending: VecDeque::new(),
                issuers: Vec::new(),
            }),
        });

        refresh_fleet(&inner, directory.as_ref()).await;

        let refresh_stop = Arc::new(Shutdown::default());
        let refresh_task = tokio::spawn(refresh_loop(
            inner.clone(),
            directory.clone(),
            refresh_stop.clone(),
        ));

        Ok(Self {
            inner,
            directory,
            refresh_stop,
            refresh_task: Mutex::new(Some(refresh_task)),
        })
    }

    /// Chunks `ops` into batches of at most `max_ops_per_batch` and admits
    /// each one to the queue with the fewest batches, lowest id winning
    /// ties. Returns once everything is admitted; settlement happens on the
    /// queue workers.
    pub async fn submit(
        &self,
        ops: Vec<Operation>,
        memo: Option<String>,
        tag: &str,
    ) -> Result<(), SubmitError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        if state.queues.is_empty() {
            return Err(SubmitError::NoDistributorsAvailable);
        }

        state.pending.extend(ops);
        while !state.pending.is_empty() {
            let take = state.pending.len().min(self.inner.cfg.max_ops_per_batch);
            let chunk: Vec<Operation> = state.pending.drain(..take).collect();
            let Some(queue) = state
                .queues
                .values()
                .min_by_key(|q| (q.size(), q.id()))
                .cloned()
            else {
                return Err(SubmitError::NoDistributorsAvailable);
            };

            let batch = Batch {
                ops: chunk,
                memo: memo.clone(),
                // Defensive clone: a later issuer refresh must not touch
                // batches already in flight.
                issuers: state.issuers.clone(),
                tag: tag.to_string(),
                retry_count: 0,
            };
            tracing::debug!(
                tag = %tag,
                queue = queue.id(),
                ops = take,
                depth = queue.size(),
                "admitting batch"
            );
            if let Err(refused) = queue.enqueue(batch).await {
                for op in refused.batch.ops.into_iter().rev() {
                    state.pending.push_front(op);
                }
                tracing::warn!(
                    tag = %tag,
                    queue = refused.id,
                    "queue refused batch; operations returned to pending"
                );
                return Err(SubmitError::AdmissionFailed { queue: refused.id });
            }
        }
        Ok(())
    }

    /// Re-reads the distributor fleet and issuer set now instead of waiting
    /// for the next periodic refresh.
    pub async fn refresh_now(&self) {
        refresh_fleet(&self.inner, self.directory.as_ref()).await;
    }

    /// Current queue depths, ordered by distributor id.
    pub async fn queue_sizes(&self) -> Vec<(u32, usize)> {
        let state = self.inner.state.lock().await;
        let mut sizes: Vec<(u32, usize)> =
            state.queues.values().map(|q| (q.id(), q.size())).collect();
        sizes.sort_by_key(|&(id, _)| id);
        sizes
    }

    /// Stops the refresh task and every queue worker. Workers finish their
    /// current batch; everything still queued is discarded.
    pub async fn shutdown(&self) {
        self.refresh_stop.request();
        if let Some(task) = self.refresh_task.lock().await.take() {
            let _ = task.await;
        }

        let (queues, pending) = {
            let mut state = self.inner.state.lock().await;
            let queues: Vec<Arc<DistributorQueue>> =
                state.queues.drain().map(|(_, queue)| queue).collect();
            let pending = state.pending.len();
            state.pending.clear();
            (queues, pending)
        };
        if pending > 0 {
            tracing::warn!(pending, "dropping unadmitted operations at shutdown");
        }

        for queue in &queues {
            queue.quit();
        }
        let joins = join_all(queues.iter().map(|queue| queue.join()));
        if tokio::time::timeout(self.inner.cfg.shutdown_deadline, joins)
            .await
            .is_err()
        {
            tracing::warn!("shutdown deadline exceeded; abandoning remaining workers");
        }
        tracing::info!(queues = queues.len(), "dispatcher stopped");
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    #[cfg(test)]
    pub(crate) async fn issuers(&self) -> Vec<Credential> {
        self.inner.state.lock().await.issuers.clone()
    }

    #[cfg(test)]
    pub(crate) async fn quit_queue(&self, id: u32) {
        if let Some(queue) = self.inner.state.lock().await.queues.get(&id) {
            queue.quit();
        }
    }
}

async fn refresh_loop<G, S, D>(
    inner: Arc<DispatcherInner<G, S>>,
    directory: Arc<D>,
    stop: Arc<Shutdown>,
) where
    G: BlockchainGateway,
    S: SettingsStore,
    D: DistributorSource,
{
    loop {
        if !stop.sleep(inner.cfg.refresh_interval).await {
            return;
        }
        refresh_fleet(&inner, directory.as_ref()).await;
    }
}

/// Diffs the local fleet against the upstream directory: retired ids are
/// quit and evicted, new ids get a queue, distributors with credential
/// material we cannot decode are skipped with a warning. The issuer set is
/// refreshed independently, even when the directory read fails.
async fn refresh_fleet<G, S, D>(inner: &DispatcherInner<G, S>, directory: &D)
where
    G: BlockchainGateway,
    S: SettingsStore,
    D: DistributorSource,
{
    let records = match directory.active_distributors().await {
        Ok(records) => Some(records),
        Err(err) => {
            tracing::warn!(error = %err, "distributor directory read failed; keeping current fleet");
            None
        }
    };

    let issuers: Vec<Credential> = inner
        .settings
        .issuer_credential()
        .await
        .into_iter()
        .collect();

    let mut state = inner.state.lock().await;
    state.issuers = issuers;

    let Some(records) = records else { return };

    let upstream: HashMap<u32, &DistributorRecord> = records
        .iter()
        .filter(|record| record.active)
        .map(|record| (record.id, record))
        .collect();

    let gone: Vec<u32> = state
        .queues
        .keys()
        .filter(|id| !upstream.contains_key(id))
        .copied()
        .collect();
    for id in gone {
        if let Some(queue) = state.queues.remove(&id) {
            tracing::info!(
                queue = id,
                queued = queue.size(),
                "distributor retired; stopping its queue"
            );
            queue.quit();
        }
    }

    for (id, record) in upstream {
        if state.queues.contains_key(&id) {
            continue;
        }
        match Credential::decode(&record.material) {
            Ok(credential) => {
                tracing::info!(queue = id, distributor = %credential.public(), "distributor added");
                let queue =
                    DistributorQueue::spawn(id, credential, inner.sender.clone(), inner.cfg.clone());
                state.queues.insert(id, queue);
            }
            Err(err) => {
                tracing::warn!(queue = id, error = %err, "invalid distributor credential; skipping");
            }
        }
    }
}
