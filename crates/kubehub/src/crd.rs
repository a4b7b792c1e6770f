//! `ReplicaGroup` custom resource: the Kubernetes shape of a DesiredState.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::{CustomResource, ResourceExt};
use replicon_core::status::CONDITION_AVAILABLE;
use replicon_core::{Condition, ConditionStatus, DesiredState, GroupStatus};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "replicon.dev";
pub const VERSION: &str = "v1";
pub const KIND: &str = "ReplicaGroup";
pub const API_VERSION: &str = "replicon.dev/v1";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "replicon.dev",
    version = "v1",
    kind = "ReplicaGroup",
    plural = "replicagroups",
    shortname = "rg",
    namespaced,
    status = "ReplicaGroupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupSpec {
    /// Desired number of pods. Defaults to 1; negative values are treated as 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Label query over pods that count toward the replica total.
    pub selector: GroupSelector,
    /// Pod template used for every created pod.
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaGroupStatus {
    /// Live pods observed by the last pass.
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub conditions: Vec<GroupCondition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GroupCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// True | False | Unknown
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub last_transition_time: Option<String>,
}

impl From<&Condition> for GroupCondition {
    fn from(c: &Condition) -> Self {
        Self {
            type_: c.type_.clone(),
            status: c.status.as_str().to_string(),
            reason: Some(c.reason.clone()),
            message: Some(c.message.clone()),
            last_transition_time: Some(c.last_transition_time.to_rfc3339()),
        }
    }
}

impl GroupCondition {
    pub fn to_condition(&self) -> Condition {
        let status = match self.status.as_str() {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        };
        let last_transition_time = self
            .last_transition_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();
        Condition {
            type_: self.type_.clone(),
            status,
            reason: self.reason.clone().unwrap_or_default(),
            message: self.message.clone().unwrap_or_default(),
            last_transition_time,
        }
    }
}

impl ReplicaGroup {
    pub fn desired_replicas(&self) -> u32 {
        self.spec.replicas.unwrap_or(1).max(0) as u32
    }

    pub fn to_desired(&self) -> DesiredState {
        let status = self
            .status
            .as_ref()
            .map(|s| GroupStatus {
                condition: s.conditions.iter().find(|c| c.type_ == CONDITION_AVAILABLE).map(GroupCondition::to_condition),
                observed_replicas: s.replicas.max(0) as u32,
            })
            .unwrap_or_default();
        DesiredState {
            name: self.name_any(),
            namespace: self.namespace().unwrap_or_else(|| "default".to_string()),
            kind: KIND.to_string(),
            uid: self.uid(),
            desired_replicas: self.desired_replicas(),
            unit_template: serde_json::to_value(&self.spec.template).unwrap_or(serde_json::Value::Null),
            selector_labels: self.spec.selector.match_labels.clone(),
            status,
        }
    }
}

/// Merge patch body for the status subresource.
pub fn status_patch(condition: &Condition, observed: u32) -> serde_json::Value {
    serde_json::json!({
        "status": ReplicaGroupStatus {
            replicas: i32::try_from(observed).unwrap_or(i32::MAX),
            conditions: vec![GroupCondition::from(condition)],
        }
    })
}
