//! One reconciliation pass: fetch → filter → diff → mutate → report.

use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use replicon_core::naming::NameGenerator;
use replicon_core::prelude::*;
use replicon_core::{diff, ownership, status};
use replicon_store::UnitStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::error::ReconcileError;
use crate::executor::{interruptible, MutationExecutor};

/// What the Driver should do with the key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl PassResult {
    pub fn done() -> Self { Self::default() }

    pub fn requeue() -> Self { Self { requeue: true, requeue_after: None } }

    pub fn after(d: Option<Duration>) -> Self { Self { requeue: false, requeue_after: d } }
}

/// Stateless between passes: everything it knows comes through the store.
pub struct Reconciler<S> {
    store: S,
    cfg: ControllerConfig,
}

impl<S: UnitStore> Reconciler<S> {
    pub fn new(store: S, cfg: ControllerConfig) -> Self { Self { store, cfg } }

    pub fn store(&self) -> &S { &self.store }

    pub fn config(&self) -> &ControllerConfig { &self.cfg }

    /// Run one pass for `key`. Creates draw names from `names`; every store
    /// call is abandoned as soon as `cancel` fires.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        names: &mut NameGenerator,
        cancel: &CancellationToken,
    ) -> Result<PassResult, ReconcileError> {
        let started = Instant::now();
        let res = self.pass(key, names, cancel).await;
        histogram!("reconcile_pass_ms", started.elapsed().as_secs_f64() * 1000.0);
        let result = match &res {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        counter!("reconcile_passes_total", 1u64, "result" => result);
        res
    }

    async fn call<T>(
        &self,
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, ReconcileError> {
        match interruptible(cancel, fut).await {
            Some(r) => r.map_err(ReconcileError::from),
            None => Err(ReconcileError::Cancelled { outcome: ReconcileOutcome::default() }),
        }
    }

    async fn pass(
        &self,
        key: &ObjectKey,
        names: &mut NameGenerator,
        cancel: &CancellationToken,
    ) -> Result<PassResult, ReconcileError> {
        let desired = match self.call(cancel, self.store.get(key)).await {
            Ok(ds) => ds,
            Err(ReconcileError::Store(e)) if e.is_not_found() => {
                debug!("desired state gone; nothing to do");
                return Ok(PassResult::done());
            }
            Err(e) => return Err(e),
        };

        let mut persisted = desired.status.clone();
        if persisted.condition.is_none() {
            let initial = status::initial(Utc::now());
            self.call(cancel, self.store.update_status(key, &initial, persisted.observed_replicas)).await?;
            persisted.condition = Some(initial);
        }

        let units = self.call(cancel, self.store.list(&desired.namespace, &desired.selector_labels)).await?;
        let owned = ownership::owned_set(&units, &desired);
        let plan = diff::plan(desired.desired_replicas, &owned);
        info!(
            desired = plan.desired,
            live = plan.live,
            owned = owned.len(),
            observed = units.len(),
            actions = plan.len(),
            "planned"
        );

        let outcome = MutationExecutor::new(&self.store, names, self.cfg.delete_grace_secs)
            .execute(&desired, plan.actions(), plan.live, cancel)
            .await;
        if outcome.cancelled {
            return Err(ReconcileError::Cancelled { outcome });
        }

        let condition = status::report(persisted.condition.as_ref(), plan.is_steady(), &outcome, Utc::now());
        let written = if status::needs_update(&persisted, &condition, outcome.final_owned_count) {
            match interruptible(cancel, self.store.update_status(key, &condition, outcome.final_owned_count)).await {
                Some(r) => r.map_err(ReconcileError::from),
                None => Err(ReconcileError::Cancelled { outcome: outcome.clone() }),
            }
        } else {
            Ok(())
        };

        if let Some(failure) = outcome.first_failure().cloned() {
            if let Err(e) = written {
                warn!(error = %e, "status update after failed mutation also failed");
            }
            return Err(ReconcileError::Mutation { failure, outcome });
        }
        written?;

        info!(
            created = outcome.created_count,
            deleted = outcome.deleted_count,
            owned = outcome.final_owned_count,
            status = condition.status.as_str(),
            "pass complete"
        );
        if plan.is_steady() {
            Ok(PassResult::after(self.cfg.resync))
        } else {
            Ok(PassResult::requeue())
        }
    }
}
