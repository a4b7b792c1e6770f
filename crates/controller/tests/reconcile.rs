#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use replicon_controller::{ControllerConfig, Driver, PassResult, ReconcileError, Reconciler};
use replicon_core::naming::NameGenerator;
use replicon_core::prelude::*;
use replicon_core::status::{MESSAGE_CONVERGED, MESSAGE_STARTING};
use replicon_store::{Call, MemoryStore, Op};
use tokio_util::sync::CancellationToken;

fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn desired(replicas: u32) -> DesiredState {
    DesiredState {
        name: "web".into(),
        namespace: "ns".into(),
        kind: replicon_core::DEFAULT_KIND.into(),
        uid: Some("uid-1".into()),
        desired_replicas: replicas,
        unit_template: serde_json::json!({"metadata": {"labels": {"tier": "front"}}}),
        selector_labels: labels(&[("app", "web")]),
        status: GroupStatus::default(),
    }
}

fn at(s: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(s, 0).unwrap()
}

fn owned_unit(name: &str, owner: &str, ts: i64) -> ObservedUnit {
    ObservedUnit {
        name: name.into(),
        namespace: "ns".into(),
        labels: labels(&[("app", "web")]),
        owner_references: smallvec::smallvec![OwnerRef {
            kind: replicon_core::DEFAULT_KIND.into(),
            name: owner.into(),
            uid: None,
        }],
        creation_timestamp: at(ts),
        phase: UnitPhase::Running,
    }
}

fn key() -> ObjectKey {
    ObjectKey::new("ns", "web")
}

fn setup(replicas: u32) -> (Arc<MemoryStore>, Reconciler<Arc<MemoryStore>>) {
    let store = Arc::new(MemoryStore::new());
    store.apply_desired(desired(replicas));
    let rec = Reconciler::new(Arc::clone(&store), ControllerConfig::default());
    (store, rec)
}

fn status_of(store: &MemoryStore) -> GroupStatus {
    store.current().desired.get(&key()).expect("desired present").status.clone()
}

fn unit_names(store: &MemoryStore) -> Vec<String> {
    store.current().sorted_units().into_iter().map(|u| u.name).collect()
}

#[tokio::test]
async fn scale_up_from_empty_then_converge() {
    let (store, rec) = setup(3);
    let mut names = NameGenerator::seeded(11);
    let cancel = CancellationToken::new();

    let first = rec.reconcile(&key(), &mut names, &cancel).await.expect("pass 1");
    assert_eq!(first, PassResult::requeue());
    let st = status_of(&store);
    let cond = st.condition.expect("condition written");
    assert_eq!(cond.status, ConditionStatus::Unknown);
    assert_eq!(cond.message, MESSAGE_STARTING);
    assert_eq!(st.observed_replicas, 3);

    let units = store.current().sorted_units();
    assert_eq!(units.len(), 3);
    for u in &units {
        assert!(u.name.starts_with("web-"), "{}", u.name);
        assert_eq!(u.labels, labels(&[("app", "web"), ("tier", "front")]));
        assert_eq!(u.owner_references[0].name, "web");
        assert_eq!(u.owner_references[0].uid.as_deref(), Some("uid-1"));
    }

    let second = rec.reconcile(&key(), &mut names, &cancel).await.expect("pass 2");
    assert_eq!(second, PassResult::done());
    let st = status_of(&store);
    let cond = st.condition.expect("condition");
    assert_eq!(cond.status, ConditionStatus::True);
    assert_eq!(cond.message, MESSAGE_CONVERGED);
    assert_eq!(st.observed_replicas, 3);
}

#[tokio::test]
async fn initial_unknown_is_persisted_before_listing() {
    let (store, rec) = setup(0);
    rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.expect("pass");
    let journal = store.journal();
    assert_eq!(journal[0], Call::Get(key()));
    assert_eq!(journal[1], Call::UpdateStatus(key()));
    assert_eq!(journal[2], Call::List("ns".into()));
    assert_eq!(status_of(&store).condition.expect("cond").status, ConditionStatus::True);
}

#[tokio::test]
async fn steady_state_skips_redundant_status_writes() {
    let (store, rec) = setup(1);
    store.insert_unit(owned_unit("web-a", "web", 1));
    let mut names = NameGenerator::seeded(1);
    let cancel = CancellationToken::new();
    rec.reconcile(&key(), &mut names, &cancel).await.expect("pass 1");
    let converged = status_of(&store).condition.expect("cond");
    assert_eq!(converged.status, ConditionStatus::True);

    store.clear_journal();
    rec.reconcile(&key(), &mut names, &cancel).await.expect("pass 2");
    assert_eq!(store.journal(), vec![Call::Get(key()), Call::List("ns".into())]);
    assert_eq!(status_of(&store).condition.expect("cond"), converged);
}

#[tokio::test]
async fn only_exactly_owned_units_are_counted() {
    let (store, rec) = setup(1);
    store.insert_unit(owned_unit("web-a", "web", 1));
    store.insert_unit(owned_unit("web2-a", "web2", 2));
    store.insert_unit(owned_unit("we-a", "we", 3));
    let mut orphan = owned_unit("orphan", "web", 4);
    orphan.owner_references.clear();
    store.insert_unit(orphan);

    let res = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.expect("pass");
    assert_eq!(res, PassResult::done());
    assert_eq!(unit_names(&store), vec!["orphan", "we-a", "web-a", "web2-a"]);
    assert!(!store.journal().iter().any(|c| matches!(c, Call::Create(_) | Call::Delete(_))));
}

#[tokio::test]
async fn scale_down_removes_newest_first() {
    let (store, rec) = setup(1);
    store.insert_unit(owned_unit("t1", "web", 1));
    store.insert_unit(owned_unit("t2", "web", 2));
    store.insert_unit(owned_unit("t3", "web", 3));
    store.clear_journal();

    let res = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.expect("pass");
    assert_eq!(res, PassResult::requeue());
    let deletes: Vec<Call> = store.journal().into_iter().filter(|c| matches!(c, Call::Delete(_))).collect();
    assert_eq!(deletes, vec![Call::Delete("t3".into()), Call::Delete("t2".into())]);
    assert_eq!(unit_names(&store), vec!["t1"]);
    assert_eq!(status_of(&store).observed_replicas, 1);
}

#[tokio::test]
async fn mutation_failure_stops_pass_and_reports_false() {
    let (store, rec) = setup(2);
    for (i, n) in ["u1", "u2", "u3", "u4", "u5"].iter().enumerate() {
        store.insert_unit(owned_unit(n, "web", i as i64 + 1));
    }
    store.fail_nth(Op::Delete, 2, StoreError::transient("api unavailable"));
    store.clear_journal();

    let err = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.unwrap_err();
    let ReconcileError::Mutation { failure, outcome } = err else {
        panic!("expected mutation error");
    };
    assert_eq!(failure.target, "ns/u4");
    assert_eq!(outcome.deleted_count, 1);
    assert_eq!(outcome.final_owned_count, 4);

    let deletes: Vec<Call> = store.journal().into_iter().filter(|c| matches!(c, Call::Delete(_))).collect();
    assert_eq!(deletes, vec![Call::Delete("u5".into()), Call::Delete("u4".into())]);
    assert_eq!(unit_names(&store), vec!["u1", "u2", "u3", "u4"]);

    let st = status_of(&store);
    let cond = st.condition.expect("cond");
    assert_eq!(cond.status, ConditionStatus::False);
    assert!(cond.message.starts_with("delete failed for ns/u4"), "{}", cond.message);
    assert_eq!(st.observed_replicas, 4);
}

#[tokio::test]
async fn create_conflict_counts_as_created() {
    let (store, rec) = setup(2);
    store.fail_nth(Op::Create, 1, StoreError::AlreadyExists("web-xxxxx".into()));

    let res = rec.reconcile(&key(), &mut NameGenerator::seeded(3), &CancellationToken::new()).await.expect("pass");
    assert_eq!(res, PassResult::requeue());
    assert_eq!(status_of(&store).observed_replicas, 2);
    assert_eq!(store.current().units.len(), 1);
}

#[tokio::test]
async fn status_write_failure_after_mutations_surfaces_store_error() {
    let (store, rec) = setup(3);
    // first write is the initial Unknown, second the post-mutation status
    store.fail_nth(Op::UpdateStatus, 2, StoreError::Conflict("stale resourceVersion".into()));

    let err = rec.reconcile(&key(), &mut NameGenerator::seeded(5), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Conflict(_))), "{err:?}");
    assert_eq!(store.current().units.len(), 3, "applied creates are kept");
    let st = status_of(&store);
    assert_eq!(st.condition.expect("cond").status, ConditionStatus::Unknown);
    assert_eq!(st.observed_replicas, 0);
}

#[tokio::test]
async fn mutation_error_wins_over_status_write_error() {
    let (store, rec) = setup(1);
    for (i, n) in ["u1", "u2", "u3"].iter().enumerate() {
        store.insert_unit(owned_unit(n, "web", i as i64 + 1));
    }
    store.fail_nth(Op::Delete, 1, StoreError::transient("api unavailable"));
    store.fail_nth(Op::UpdateStatus, 2, StoreError::transient("etcd timeout"));

    let err = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.unwrap_err();
    let ReconcileError::Mutation { failure, outcome } = err else {
        panic!("expected mutation error");
    };
    assert_eq!(failure.target, "ns/u3");
    assert_eq!(outcome.deleted_count, 0);
    assert_eq!(unit_names(&store), vec!["u1", "u2", "u3"]);
    assert_eq!(status_of(&store).condition.expect("cond").status, ConditionStatus::Unknown);
}

#[tokio::test]
async fn missing_desired_state_is_a_noop() {
    let store = Arc::new(MemoryStore::new());
    let rec = Reconciler::new(Arc::clone(&store), ControllerConfig::default());
    let res = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.expect("pass");
    assert_eq!(res, PassResult::done());
    assert_eq!(store.journal(), vec![Call::Get(key())]);
}

#[tokio::test]
async fn get_failure_surfaces_store_error() {
    let (store, rec) = setup(1);
    store.fail_nth(Op::Get, 1, StoreError::transient("timeout"));
    let err = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(StoreError::Transient(_))));
    assert!(store.current().units.is_empty());
}

#[tokio::test]
async fn cancelled_pass_touches_nothing() {
    let (store, rec) = setup(3);
    store.clear_journal();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &cancel).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled { .. }));
    assert!(store.journal().is_empty());
    assert!(status_of(&store).condition.is_none());
}

#[tokio::test]
async fn resync_is_returned_when_converged() {
    let store = Arc::new(MemoryStore::new());
    store.apply_desired(desired(0));
    let cfg = ControllerConfig { resync: Some(Duration::from_secs(300)), ..ControllerConfig::default() };
    let rec = Reconciler::new(Arc::clone(&store), cfg);
    let res = rec.reconcile(&key(), &mut NameGenerator::seeded(1), &CancellationToken::new()).await.expect("pass");
    assert_eq!(res, PassResult::after(Some(Duration::from_secs(300))));
}

#[tokio::test]
async fn driver_converges_and_shuts_down() {
    let store = Arc::new(MemoryStore::new().with_create_phase(UnitPhase::Running));
    store.apply_desired(desired(3));
    let cfg = ControllerConfig {
        workers: 2,
        name_seed: Some(7),
        backoff_base: Duration::from_millis(5),
        ..ControllerConfig::default()
    };
    let driver = Driver::new(Arc::clone(&store), cfg);
    let queue = driver.queue();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(shutdown.clone()));

    queue.add(key());
    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let st = status_of(&store);
            if st.condition.as_ref().map(|c| c.status) == Some(ConditionStatus::True) {
                return st;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("driver converged");
    assert_eq!(converged.observed_replicas, 3);
    assert_eq!(store.current().units.len(), 3);

    // scale down through the same running driver
    store.apply_desired(desired(1));
    queue.add(key());
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.current().units.len() != 1 || status_of(&store).observed_replicas != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("driver scaled down");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.expect("driver stopped").expect("join");
    assert!(queue.is_shutdown());
}

#[tokio::test]
async fn retry_count_is_shared_across_workers() {
    let store = Arc::new(MemoryStore::new().with_create_phase(UnitPhase::Running));
    store.apply_desired(desired(2));
    store.fail_nth(Op::Get, 1, StoreError::transient("apiserver restarting"));
    store.fail_nth(Op::Get, 2, StoreError::transient("apiserver restarting"));
    let cfg = ControllerConfig {
        workers: 3,
        name_seed: Some(1),
        backoff_base: Duration::from_millis(5),
        ..ControllerConfig::default()
    };
    let driver = Driver::new(Arc::clone(&store), cfg);
    let queue = driver.queue();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(driver.run(shutdown.clone()));

    queue.add(key());
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let st = status_of(&store);
            let converged = st.condition.as_ref().map(|c| c.status) == Some(ConditionStatus::True);
            if converged && queue.num_requeues(&key()) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("converged and retry count reset");

    // a later failure on whichever worker starts again from the first attempt
    assert_eq!(queue.next_attempt(&key()), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.expect("driver stopped").expect("join");
}
