//! Driver: a fixed pool of workers pulling keys off the [`WorkQueue`].

use std::sync::Arc;
use std::time::Duration;

use replicon_core::naming::NameGenerator;
use replicon_core::ObjectKey;
use replicon_store::UnitStore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::queue::WorkQueue;
use crate::reconcile::{PassResult, Reconciler};

pub struct Driver<S> {
    reconciler: Arc<Reconciler<S>>,
    queue: Arc<WorkQueue>,
}

impl<S: UnitStore + 'static> Driver<S> {
    pub fn new(store: S, cfg: ControllerConfig) -> Self {
        let queue = Arc::new(WorkQueue::with_capacity(cfg.queue_cap));
        Self { reconciler: Arc::new(Reconciler::new(store, cfg)), queue }
    }

    /// Handle for producers (watchers, resync feeders) to enqueue keys.
    pub fn queue(&self) -> Arc<WorkQueue> { Arc::clone(&self.queue) }

    pub fn reconciler(&self) -> Arc<Reconciler<S>> { Arc::clone(&self.reconciler) }

    /// Run workers until `shutdown` fires. In-flight passes are cancelled and
    /// awaited before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        let cfg = self.reconciler.config().clone();
        info!(workers = cfg.workers, grace = cfg.delete_grace_secs, "driver starting");
        let mut set = JoinSet::new();
        for idx in 0..cfg.workers {
            let names = match cfg.name_seed {
                Some(seed) => NameGenerator::seeded(seed.wrapping_add(idx as u64)),
                None => NameGenerator::from_entropy(),
            };
            let worker = Worker {
                idx,
                reconciler: Arc::clone(&self.reconciler),
                queue: Arc::clone(&self.queue),
                names,
                shutdown: shutdown.clone(),
            };
            set.spawn(worker.run());
        }
        shutdown.cancelled().await;
        info!("driver stopping");
        self.queue.shutdown();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("driver stopped");
    }
}

struct Worker<S> {
    idx: usize,
    reconciler: Arc<Reconciler<S>>,
    queue: Arc<WorkQueue>,
    names: NameGenerator,
    shutdown: CancellationToken,
}

impl<S: UnitStore + 'static> Worker<S> {
    async fn run(mut self) {
        debug!(worker = self.idx, "worker started");
        while let Some(key) = self.queue.get().await {
            let cancel = self.shutdown.child_token();
            let timer = tokio::spawn({
                let cancel = cancel.clone();
                let timeout = self.reconciler.config().pass_timeout;
                async move {
                    tokio::time::sleep(timeout).await;
                    cancel.cancel();
                }
            });
            let res = self.reconciler.reconcile(&key, &mut self.names, &cancel).await;
            timer.abort();
            self.queue.done(&key);
            if self.shutdown.is_cancelled() {
                break;
            }
            match res {
                Ok(PassResult { requeue: true, .. }) => self.retry(key, None),
                Ok(PassResult { requeue_after: Some(d), .. }) => {
                    self.queue.forget(&key);
                    self.queue.add_after(key, d);
                }
                Ok(_) => self.queue.forget(&key),
                Err(e) => self.retry(key, Some(e.to_string())),
            }
        }
        debug!(worker = self.idx, "worker exited");
    }

    /// Rate-limited requeue: exponential backoff per key.
    fn retry(&self, key: ObjectKey, error: Option<String>) {
        let n = self.queue.next_attempt(&key);
        let delay: Duration = self.reconciler.config().backoff(n);
        match error {
            Some(error) => warn!(key = %key, attempt = n, delay_ms = delay.as_millis() as u64, %error, "pass failed; requeueing"),
            None => debug!(key = %key, delay_ms = delay.as_millis() as u64, "not converged yet; requeueing"),
        }
        self.queue.add_after(key, delay);
    }
}
