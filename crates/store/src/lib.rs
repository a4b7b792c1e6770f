//! Replicon store: the Unit Store Client interface and an in-RAM implementation.
//!
//! The in-RAM store publishes immutable snapshots through `ArcSwap` and bumps
//! an epoch on every write so watchers can re-trigger reconciliation.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use replicon_core::ownership::labels_match;
use replicon_core::prelude::*;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Everything the reconciliation core needs from the backing store.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Fetch a DesiredState; `StoreError::NotFound` when it is gone.
    async fn get(&self, key: &ObjectKey) -> Result<DesiredState, StoreError>;
    /// List units in `namespace` whose labels contain `selector`.
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ObservedUnit>, StoreError>;
    async fn create(&self, unit: &NewUnit) -> Result<(), StoreError>;
    async fn delete(&self, unit: &UnitRef, grace_period_seconds: u32) -> Result<(), StoreError>;
    async fn update_status(&self, key: &ObjectKey, condition: &Condition, observed: u32) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: UnitStore + ?Sized> UnitStore for Arc<T> {
    async fn get(&self, key: &ObjectKey) -> Result<DesiredState, StoreError> {
        (**self).get(key).await
    }
    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ObservedUnit>, StoreError> {
        (**self).list(namespace, selector).await
    }
    async fn create(&self, unit: &NewUnit) -> Result<(), StoreError> {
        (**self).create(unit).await
    }
    async fn delete(&self, unit: &UnitRef, grace_period_seconds: u32) -> Result<(), StoreError> {
        (**self).delete(unit, grace_period_seconds).await
    }
    async fn update_status(&self, key: &ObjectKey, condition: &Condition, observed: u32) -> Result<(), StoreError> {
        (**self).update_status(key, condition, observed).await
    }
}

/// Store operations, for fault injection and the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Delete,
    UpdateStatus,
}

/// One recorded store call, in the order it was attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ObjectKey),
    List(String),
    Create(String),
    Delete(String),
    UpdateStatus(ObjectKey),
}

#[derive(Debug)]
struct Fault {
    op: Op,
    skip: usize,
    error: StoreError,
}

/// Immutable view of the in-RAM store.
#[derive(Debug, Clone, Default)]
pub struct World {
    pub epoch: u64,
    pub desired: FxHashMap<ObjectKey, DesiredState>,
    pub units: FxHashMap<ObjectKey, ObservedUnit>,
    last_created: Option<DateTime<Utc>>,
}

impl World {
    /// Units sorted by namespace then name.
    pub fn sorted_units(&self) -> Vec<ObservedUnit> {
        let mut out: Vec<ObservedUnit> = self.units.values().cloned().collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)));
        out
    }
}

/// In-RAM Unit Store Client with change notification, a call journal and fault injection.
pub struct MemoryStore {
    snap: ArcSwap<World>,
    write: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
    faults: Mutex<Vec<Fault>>,
    journal: Mutex<Vec<Call>>,
    create_phase: UnitPhase,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            snap: ArcSwap::from_pointee(World::default()),
            write: Mutex::new(()),
            epoch_tx,
            faults: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
            create_phase: UnitPhase::Pending,
        }
    }

    /// Phase assigned to units created through `create` (default Pending).
    pub fn with_create_phase(mut self, phase: UnitPhase) -> Self {
        self.create_phase = phase;
        self
    }

    pub fn current(&self) -> Arc<World> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    /// Apply `f` to a private copy of the world and publish it as the next epoch.
    fn mutate<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        match self.try_mutate(|w| Ok::<R, std::convert::Infallible>(f(w))) {
            Ok(out) => out,
            Err(never) => match never {},
        }
    }

    /// Like `mutate`, but an `Err` discards the copy: no new snapshot, no epoch bump.
    fn try_mutate<R, E>(&self, f: impl FnOnce(&mut World) -> Result<R, E>) -> Result<R, E> {
        let _guard = self.write.lock().unwrap_or_else(|p| p.into_inner());
        let mut next = (*self.snap.load_full()).clone();
        let out = f(&mut next)?;
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(epoch);
        trace!(epoch, "memory store: published");
        Ok(out)
    }

    /// Insert or replace a DesiredState; an existing status is kept.
    pub fn apply_desired(&self, mut ds: DesiredState) {
        self.mutate(|w| {
            let key = ds.key();
            if let Some(prev) = w.desired.get(&key) {
                ds.status = prev.status.clone();
            }
            w.desired.insert(key, ds);
        });
    }

    pub fn remove_desired(&self, key: &ObjectKey) -> Option<DesiredState> {
        self.try_mutate(|w| w.desired.remove(key).ok_or(())).ok()
    }

    /// Insert a unit as-is (explicit timestamp and phase).
    pub fn insert_unit(&self, unit: ObservedUnit) {
        self.mutate(|w| {
            w.units.insert(ObjectKey::new(unit.namespace.clone(), unit.name.clone()), unit);
        });
    }

    pub fn set_phase(&self, unit: &UnitRef, phase: UnitPhase) -> bool {
        self.try_mutate(|w| match w.units.get_mut(&ObjectKey::new(unit.namespace.clone(), unit.name.clone())) {
            Some(u) => {
                u.phase = phase;
                Ok(())
            }
            None => Err(()),
        })
        .is_ok()
    }

    /// Mark every Pending unit Running; returns how many changed.
    pub fn promote_pending(&self) -> usize {
        self.mutate(|w| {
            let mut n = 0;
            for u in w.units.values_mut().filter(|u| u.phase == UnitPhase::Pending) {
                u.phase = UnitPhase::Running;
                n += 1;
            }
            n
        })
    }

    pub fn desired_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.current().desired.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Fail the `nth` (1-based) future call of `op` with `error`, once.
    pub fn fail_nth(&self, op: Op, nth: usize, error: StoreError) {
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        faults.push(Fault { op, skip: nth.saturating_sub(1), error });
    }

    pub fn journal(&self) -> Vec<Call> {
        self.journal.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn enter(&self, op: Op, call: Call) -> Result<(), StoreError> {
        self.journal.lock().unwrap_or_else(|p| p.into_inner()).push(call);
        let mut faults = self.faults.lock().unwrap_or_else(|p| p.into_inner());
        let mut fired = None;
        for (i, f) in faults.iter_mut().enumerate().filter(|(_, f)| f.op == op) {
            if f.skip == 0 && fired.is_none() {
                fired = Some(i);
            } else {
                f.skip = f.skip.saturating_sub(1);
            }
        }
        match fired {
            Some(i) => {
                let f = faults.remove(i);
                debug!(?op, error = %f.error, "memory store: injected fault");
                Err(f.error)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UnitStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<DesiredState, StoreError> {
        self.enter(Op::Get, Call::Get(key.clone()))?;
        self.current().desired.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ObservedUnit>, StoreError> {
        self.enter(Op::List, Call::List(namespace.to_string()))?;
        let mut out: Vec<ObservedUnit> = self
            .current()
            .units
            .values()
            .filter(|u| u.namespace == namespace && labels_match(&u.labels, selector))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create(&self, unit: &NewUnit) -> Result<(), StoreError> {
        self.enter(Op::Create, Call::Create(unit.name.clone()))?;
        let phase = self.create_phase;
        self.try_mutate(|w| {
            let key = ObjectKey::new(unit.namespace.clone(), unit.name.clone());
            if w.units.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            // strictly increasing so creation order is recoverable from timestamps
            let now = Utc::now();
            let ts = match w.last_created {
                Some(last) if now <= last => last + Duration::milliseconds(1),
                _ => now,
            };
            w.last_created = Some(ts);
            w.units.insert(
                key,
                ObservedUnit {
                    name: unit.name.clone(),
                    namespace: unit.namespace.clone(),
                    labels: unit.labels.clone(),
                    owner_references: std::iter::once(unit.owner.clone()).collect(),
                    creation_timestamp: ts,
                    phase,
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, unit: &UnitRef, _grace_period_seconds: u32) -> Result<(), StoreError> {
        self.enter(Op::Delete, Call::Delete(unit.name.clone()))?;
        self.try_mutate(|w| {
            w.units
                .remove(&ObjectKey::new(unit.namespace.clone(), unit.name.clone()))
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(unit.to_string()))
        })
    }

    async fn update_status(&self, key: &ObjectKey, condition: &Condition, observed: u32) -> Result<(), StoreError> {
        self.enter(Op::UpdateStatus, Call::UpdateStatus(key.clone()))?;
        self.try_mutate(|w| match w.desired.get_mut(key) {
            Some(ds) => {
                ds.status = GroupStatus { condition: Some(condition.clone()), observed_replicas: observed };
                Ok(())
            }
            None => Err(StoreError::NotFound(key.to_string())),
        })
    }
}
