//! Status reporter: derive the `Available` condition from a pass.
//!
//! States move `Unknown → {False ⇄ True}`. Each pass recomputes from the
//! prior persisted condition and this pass's outcome only.

use chrono::{DateTime, Utc};

use crate::{Condition, ConditionStatus, GroupStatus, ReconcileOutcome};

pub const CONDITION_AVAILABLE: &str = "Available";
pub const REASON_RECONCILING: &str = "Reconciling";
pub const MESSAGE_STARTING: &str = "Starting reconciliation";
pub const MESSAGE_CONVERGED: &str = "converged";

fn available(status: ConditionStatus, message: String, now: DateTime<Utc>) -> Condition {
    Condition {
        type_: CONDITION_AVAILABLE.to_string(),
        status,
        reason: REASON_RECONCILING.to_string(),
        message,
        last_transition_time: now,
    }
}

/// Condition recorded on first observation of a DesiredState.
pub fn initial(now: DateTime<Utc>) -> Condition {
    available(ConditionStatus::Unknown, MESSAGE_STARTING.to_string(), now)
}

/// Replace `prior` with `next`, keeping the prior transition time when the status did not change.
pub fn set_condition(prior: Option<&Condition>, mut next: Condition) -> Condition {
    if let Some(p) = prior {
        if p.status == next.status {
            next.last_transition_time = p.last_transition_time;
        }
    }
    next
}

/// Condition after a pass.
///
/// - any failure: False with the first failure as message
/// - no actions and no failures: True, "converged"
/// - actions issued without failure (or an interrupted pass): unchanged
pub fn report(prior: Option<&Condition>, steady: bool, outcome: &ReconcileOutcome, now: DateTime<Utc>) -> Condition {
    if let Some(f) = outcome.first_failure() {
        return set_condition(prior, available(ConditionStatus::False, f.to_string(), now));
    }
    if steady && !outcome.cancelled {
        return set_condition(prior, available(ConditionStatus::True, MESSAGE_CONVERGED.to_string(), now));
    }
    prior.cloned().unwrap_or_else(|| initial(now))
}

/// True when persisting `(condition, observed)` would change the stored status.
pub fn needs_update(current: &GroupStatus, condition: &Condition, observed: u32) -> bool {
    current.condition.as_ref() != Some(condition) || current.observed_replicas != observed
}
