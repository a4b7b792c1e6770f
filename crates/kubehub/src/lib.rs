//! Replicon kubehub: ReplicaGroup CRD, Pod-backed unit store, and watch wiring.
//!
//! Watchers only translate events into keys; every reconciliation pass
//! re-reads the full state, so a dropped or duplicated event is harmless.

#![forbid(unsafe_code)]

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use replicon_core::ObjectKey;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod client;
pub mod crd;

pub use client::KubeUnitStore;
pub use crd::{ReplicaGroup, ReplicaGroupSpec, ReplicaGroupStatus};

fn group_key(rg: &ReplicaGroup) -> ObjectKey {
    ObjectKey::new(rg.namespace().unwrap_or_else(|| "default".to_string()), rg.name_any())
}

/// Keys of the ReplicaGroups a pod points at through its owner references.
pub fn owner_keys(pod: &Pod) -> Vec<ObjectKey> {
    let ns = pod.namespace().unwrap_or_else(|| "default".to_string());
    pod.owner_references()
        .iter()
        .filter(|o| o.kind == crd::KIND && o.api_version == crd::API_VERSION)
        .map(|o| ObjectKey::new(ns.clone(), o.name.clone()))
        .collect()
}

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// List+watch ReplicaGroups and send their keys into `key_tx`.
pub async fn watch_groups(client: Client, namespace: Option<&str>, key_tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let api: Api<ReplicaGroup> = scoped(client, namespace);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "replicagroup watcher started");
    while let Some(ev) = stream.try_next().await? {
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(rg) | Event::Deleted(rg) => vec![group_key(&rg)],
            Event::Restarted(list) => {
                debug!(count = list.len(), "replicagroup watch restart");
                list.iter().map(group_key).collect()
            }
        };
        for k in keys {
            if key_tx.send(k).await.is_err() {
                return Ok(());
            }
        }
    }
    warn!("replicagroup watcher stream ended");
    Ok(())
}

/// List+watch Pods and send the keys of their owning ReplicaGroups into `key_tx`.
pub async fn watch_units(client: Client, namespace: Option<&str>, key_tx: mpsc::Sender<ObjectKey>) -> Result<()> {
    let api: Api<Pod> = scoped(client, namespace);
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "pod watcher started");
    while let Some(ev) = stream.try_next().await? {
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(p) | Event::Deleted(p) => owner_keys(&p),
            Event::Restarted(list) => {
                debug!(count = list.len(), "pod watch restart");
                let mut ks: Vec<ObjectKey> = list.iter().flat_map(owner_keys).collect();
                ks.sort();
                ks.dedup();
                ks
            }
        };
        for k in keys {
            if key_tx.send(k).await.is_err() {
                return Ok(());
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}
