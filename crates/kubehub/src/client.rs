//! Pod-backed Unit Store Client over kube-rs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use replicon_core::prelude::*;
use replicon_store::UnitStore;
use tracing::debug;

use crate::crd::{status_patch, ReplicaGroup, API_VERSION};

/// Map a kube error onto the store taxonomy.
pub fn classify(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        other => StoreError::Transient(other.to_string()),
    }
}

/// `k=v,k2=v2` form for a list label selector.
pub fn selector_string(selector: &Labels) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

pub fn observed_from_pod(pod: &Pod) -> ObservedUnit {
    let meta = &pod.metadata;
    ObservedUnit {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
        labels: meta.labels.clone().unwrap_or_default(),
        owner_references: meta
            .owner_references
            .iter()
            .flatten()
            .map(|o| OwnerRef { kind: o.kind.clone(), name: o.name.clone(), uid: Some(o.uid.clone()) })
            .collect(),
        creation_timestamp: meta.creation_timestamp.as_ref().map(|t| t.0).unwrap_or_default(),
        phase: UnitPhase::from_reported(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
    }
}

/// Build the Pod for a create action: template spec, merged labels, controller owner reference.
pub fn pod_for(unit: &NewUnit) -> Result<Pod, StoreError> {
    let template: PodTemplateSpec = if unit.template.is_null() {
        PodTemplateSpec::default()
    } else {
        serde_json::from_value(unit.template.clone())
            .map_err(|e| StoreError::transient(format!("invalid pod template: {}", e)))?
    };
    let annotations = template.metadata.as_ref().and_then(|m| m.annotations.clone());
    // kube rejects owner references without a uid
    let owner_references = unit.owner.uid.as_ref().map(|uid| {
        vec![OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: unit.owner.kind.clone(),
            name: unit.owner.name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(unit.name.clone()),
            namespace: Some(unit.namespace.clone()),
            labels: Some(unit.labels.clone()),
            annotations,
            owner_references,
            ..Default::default()
        },
        spec: template.spec,
        status: None,
    })
}

#[derive(Clone)]
pub struct KubeUnitStore {
    client: Client,
}

impl KubeUnitStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    pub fn client(&self) -> Client { self.client.clone() }

    fn groups(&self, ns: &str) -> Api<ReplicaGroup> { Api::namespaced(self.client.clone(), ns) }

    fn pods(&self, ns: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), ns) }
}

#[async_trait]
impl UnitStore for KubeUnitStore {
    async fn get(&self, key: &ObjectKey) -> Result<DesiredState, StoreError> {
        let rg = self.groups(&key.namespace).get_opt(&key.name).await.map_err(classify)?;
        rg.map(|g| g.to_desired()).ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, namespace: &str, selector: &Labels) -> Result<Vec<ObservedUnit>, StoreError> {
        let lp = if selector.is_empty() { ListParams::default() } else { ListParams::default().labels(&selector_string(selector)) };
        let pods = self.pods(namespace).list(&lp).await.map_err(classify)?;
        debug!(ns = %namespace, count = pods.items.len(), "listed pods");
        Ok(pods.items.iter().map(observed_from_pod).collect())
    }

    async fn create(&self, unit: &NewUnit) -> Result<(), StoreError> {
        let pod = pod_for(unit)?;
        self.pods(&unit.namespace).create(&PostParams::default(), &pod).await.map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, unit: &UnitRef, grace_period_seconds: u32) -> Result<(), StoreError> {
        let dp = DeleteParams { grace_period_seconds: Some(grace_period_seconds), ..Default::default() };
        let _ = self.pods(&unit.namespace).delete(&unit.name, &dp).await.map_err(classify)?;
        Ok(())
    }

    async fn update_status(&self, key: &ObjectKey, condition: &Condition, observed: u32) -> Result<(), StoreError> {
        let patch = status_patch(condition, observed);
        let _ = self
            .groups(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(classify)?;
        Ok(())
    }
}
