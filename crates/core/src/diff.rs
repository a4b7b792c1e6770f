//! Diff engine: desired replica count vs. owned units → ordered action list.
//!
//! Strictly count-driven. Only live units (Pending/Running) count toward
//! the observed total; terminated units are neither counted nor targeted.

use crate::{Action, ObservedUnit, UnitRef};

/// Ordered action list plus the live count it was computed from.
///
/// Creates are carried as a count so an arbitrarily large replica target
/// never has to be materialised up front; [`Plan::actions`] yields them lazily.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Plan {
    pub live: u32,
    pub desired: u32,
    pub creates: u32,
    /// Newest first.
    pub deletes: Vec<UnitRef>,
}

impl Plan {
    pub fn is_steady(&self) -> bool {
        self.creates == 0 && self.deletes.is_empty()
    }

    /// Number of actions; always `|live - desired|`.
    pub fn len(&self) -> u64 {
        u64::from(self.creates) + self.deletes.len() as u64
    }

    pub fn is_empty(&self) -> bool { self.is_steady() }

    /// The action list in execution order.
    pub fn actions(&self) -> impl Iterator<Item = Action> + Send + '_ {
        std::iter::repeat(Action::Create)
            .take(self.creates as usize)
            .chain(self.deletes.iter().cloned().map(Action::Delete))
    }
}

/// Live units in keep-order: oldest first, ties broken by name ascending.
pub fn live_sorted<'a>(owned: &[&'a ObservedUnit]) -> Vec<&'a ObservedUnit> {
    let mut live: Vec<&ObservedUnit> = owned.iter().copied().filter(|u| u.phase.is_live()).collect();
    live.sort_by(|a, b| a.creation_timestamp.cmp(&b.creation_timestamp).then_with(|| a.name.cmp(&b.name)));
    live
}

/// Compute the action list for one pass.
///
/// - live == desired: empty
/// - live < desired: `desired - live` creates
/// - live > desired: `live - desired` deletes of the newest live units, newest first
pub fn plan(desired: u32, owned: &[&ObservedUnit]) -> Plan {
    let live = live_sorted(owned);
    let live_count = u32::try_from(live.len()).unwrap_or(u32::MAX);
    let creates = desired.saturating_sub(live_count);
    let deletes = live.iter().skip(desired as usize).rev().map(|u| u.unit_ref()).collect();
    Plan { live: live_count, desired, creates, deletes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnitPhase;
    use chrono::{TimeZone, Utc};

    fn unit(name: &str, ts: i64, phase: UnitPhase) -> ObservedUnit {
        ObservedUnit {
            name: name.into(),
            namespace: "ns".into(),
            labels: Default::default(),
            owner_references: Default::default(),
            creation_timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
            phase,
        }
    }

    fn del(name: &str) -> Action {
        Action::Delete(UnitRef { namespace: "ns".into(), name: name.into() })
    }

    #[test]
    fn equal_counts_yield_no_actions() {
        let us = vec![unit("a", 1, UnitPhase::Running), unit("b", 2, UnitPhase::Pending)];
        let refs: Vec<_> = us.iter().collect();
        let p = plan(2, &refs);
        assert!(p.is_steady());
        assert_eq!(p.live, 2);
    }

    #[test]
    fn action_count_and_kind_follow_the_gap() {
        for d in 0u32..5 {
            for o in 0u32..5 {
                let us: Vec<_> = (0..o).map(|i| unit(&format!("u{i}"), i as i64, UnitPhase::Running)).collect();
                let refs: Vec<_> = us.iter().collect();
                let p = plan(d, &refs);
                let actions: Vec<Action> = p.actions().collect();
                assert_eq!(actions.len() as u32, d.abs_diff(o), "d={d} o={o}");
                assert_eq!(p.len(), u64::from(d.abs_diff(o)));
                if o < d {
                    assert!(actions.iter().all(|a| *a == Action::Create));
                } else if o > d {
                    assert!(actions.iter().all(|a| matches!(a, Action::Delete(_))));
                }
            }
        }
    }

    #[test]
    fn deletes_the_newest_units() {
        let us = vec![
            unit("t2", 20, UnitPhase::Running),
            unit("t1", 10, UnitPhase::Running),
            unit("t3", 30, UnitPhase::Running),
        ];
        let refs: Vec<_> = us.iter().collect();
        let p = plan(1, &refs);
        assert_eq!(p.actions().collect::<Vec<_>>(), vec![del("t3"), del("t2")]);
    }

    #[test]
    fn timestamp_ties_break_by_name() {
        let us = vec![unit("b", 5, UnitPhase::Running), unit("c", 5, UnitPhase::Running), unit("a", 5, UnitPhase::Running)];
        let refs: Vec<_> = us.iter().collect();
        // keep-order is a, b, c; the newest one is c
        assert_eq!(plan(2, &refs).actions().collect::<Vec<_>>(), vec![del("c")]);
        assert_eq!(plan(1, &refs).actions().collect::<Vec<_>>(), vec![del("c"), del("b")]);
    }

    #[test]
    fn terminated_units_are_not_counted() {
        let us = vec![
            unit("ok", 1, UnitPhase::Running),
            unit("done", 2, UnitPhase::Succeeded),
            unit("dead", 3, UnitPhase::Failed),
            unit("lost", 4, UnitPhase::Unknown),
        ];
        let refs: Vec<_> = us.iter().collect();
        let p = plan(2, &refs);
        assert_eq!(p.live, 1);
        assert_eq!(p.actions().collect::<Vec<_>>(), vec![Action::Create]);
        let shrink = plan(0, &refs);
        assert_eq!(shrink.actions().collect::<Vec<_>>(), vec![del("ok")]);
    }

    #[test]
    fn scale_to_zero_deletes_everything_live() {
        let us = vec![unit("a", 1, UnitPhase::Pending), unit("b", 2, UnitPhase::Running)];
        let refs: Vec<_> = us.iter().collect();
        assert_eq!(plan(0, &refs).actions().collect::<Vec<_>>(), vec![del("b"), del("a")]);
    }

    #[test]
    fn huge_targets_are_planned_without_allocating_creates() {
        let us = vec![unit("a", 1, UnitPhase::Running)];
        let refs: Vec<_> = us.iter().collect();
        let p = plan(i32::MAX as u32, &refs);
        assert_eq!(p.creates, i32::MAX as u32 - 1);
        assert!(p.deletes.is_empty());
        assert_eq!(p.len(), u64::from(i32::MAX as u32 - 1));
        assert_eq!(p.actions().take(3).collect::<Vec<_>>(), vec![Action::Create; 3]);

        let top = plan(u32::MAX, &[]);
        assert_eq!(top.len(), u64::from(u32::MAX));
        assert!(!top.is_steady());
    }
}
