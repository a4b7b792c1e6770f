//! Ownership filter: which observed units belong to a DesiredState.
//!
//! A unit is owned iff it carries an owner reference with exactly the
//! DesiredState's kind and name, and its labels contain every selector
//! label with an equal value. Extra labels on the unit are fine.

use crate::{DesiredState, Labels, ObservedUnit, OwnerRef};

/// Exact kind + name match. Names are never treated as patterns, so
/// `web` does not claim units of `web-canary`.
pub fn owned_by(owner: &OwnerRef, desired: &DesiredState) -> bool {
    owner.kind == desired.kind && owner.name == desired.name
}

/// Superset-equal label match.
pub fn labels_match(unit_labels: &Labels, selector: &Labels) -> bool {
    selector.iter().all(|(k, v)| unit_labels.get(k) == Some(v))
}

pub fn is_owned(unit: &ObservedUnit, desired: &DesiredState) -> bool {
    unit.namespace == desired.namespace
        && unit.owner_references.iter().any(|o| owned_by(o, desired))
        && labels_match(&unit.labels, &desired.selector_labels)
}

/// Compute the OwnedSet in one pass, preserving input order.
pub fn owned_set<'a>(units: &'a [ObservedUnit], desired: &DesiredState) -> Vec<&'a ObservedUnit> {
    units.iter().filter(|u| is_owned(u, desired)).collect()
}
