//! Mutation executor: apply an action list sequentially, fail-fast.

use std::future::Future;

use metrics::counter;
use replicon_core::naming::NameGenerator;
use replicon_core::prelude::*;
use replicon_store::UnitStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn interruptible<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

pub struct MutationExecutor<'a, S: UnitStore + ?Sized> {
    store: &'a S,
    names: &'a mut NameGenerator,
    grace_period_seconds: u32,
}

impl<'a, S: UnitStore + ?Sized> MutationExecutor<'a, S> {
    pub fn new(store: &'a S, names: &'a mut NameGenerator, grace_period_seconds: u32) -> Self {
        Self { store, names, grace_period_seconds }
    }

    fn new_unit(&mut self, desired: &DesiredState) -> NewUnit {
        NewUnit {
            name: self.names.unit_name(&desired.name),
            namespace: desired.namespace.clone(),
            labels: desired.unit_labels(),
            owner: desired.owner_ref(),
            template: desired.unit_template.clone(),
        }
    }

    /// Apply `actions` in order, each at most once. Actions are pulled one at a
    /// time, so a long run of creates is never held in memory.
    ///
    /// Stops at the first failure or when `cancel` fires; `live_before` is the
    /// live owned count the actions were planned against.
    pub async fn execute<I>(
        &mut self,
        desired: &DesiredState,
        actions: I,
        live_before: u32,
        cancel: &CancellationToken,
    ) -> ReconcileOutcome
    where
        I: IntoIterator<Item = Action>,
        I::IntoIter: Send,
    {
        let mut out = ReconcileOutcome::default();
        for action in actions {
            if cancel.is_cancelled() {
                out.cancelled = true;
                break;
            }
            let (target, res) = match &action {
                Action::Create => {
                    let unit = self.new_unit(desired);
                    let target = format!("{}/{}", unit.namespace, unit.name);
                    (target, interruptible(cancel, self.store.create(&unit)).await)
                }
                Action::Delete(unit) => (unit.to_string(), interruptible(cancel, self.store.delete(unit, self.grace_period_seconds)).await),
            };
            let Some(res) = res else {
                out.cancelled = true;
                break;
            };
            match (&action, res) {
                (Action::Create, Ok(())) => {
                    info!(unit = %target, "created unit");
                    out.created_count += 1;
                }
                (Action::Create, Err(e)) if e.is_already_exists() => {
                    debug!(unit = %target, "create hit an existing unit; counting as created");
                    out.created_count += 1;
                }
                (Action::Delete(_), Ok(())) => {
                    info!(unit = %target, "deleted unit");
                    out.deleted_count += 1;
                }
                (Action::Delete(_), Err(e)) if e.is_not_found() => {
                    debug!(unit = %target, "unit already gone; counting as deleted");
                    out.deleted_count += 1;
                }
                (_, Err(error)) => {
                    warn!(unit = %target, action = action.verb(), error = %error, "mutation failed; aborting remaining actions");
                    counter!("unit_mutation_failures_total", 1u64, "action" => action.verb());
                    out.failures.push(ActionFailure { action: action.clone(), target, error });
                    break;
                }
            }
        }
        counter!("units_created_total", u64::from(out.created_count));
        counter!("units_deleted_total", u64::from(out.deleted_count));
        out.final_owned_count = live_before.saturating_add(out.created_count).saturating_sub(out.deleted_count);
        out
    }
}
