//! Replicon core: data model and the pure half of a reconciliation pass.
//!
//! Nothing in this crate performs I/O. Ownership filtering, diffing, naming
//! and condition decisions are plain functions over in-memory snapshots, so
//! the same inputs always give the same answer.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod diff;
pub mod error;
pub mod naming;
pub mod ownership;
pub mod status;

pub use error::StoreError;

/// Default owner kind stamped on units created for a [`DesiredState`].
pub const DEFAULT_KIND: &str = "ReplicaGroup";

/// Label key/value pairs. Ordered so that rendering and comparison are stable.
pub type Labels = BTreeMap<String, String>;

/// Namespaced identity of a DesiredState; the unit of work for a Driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = String;

    /// Parses `namespace/name`; a bare `name` lands in `default`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("default", *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(format!("invalid key: {} (expect namespace/name)", s)),
        }
    }
}

/// Declared target for a group of fungible units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub name: String,
    pub namespace: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Store-assigned identity; only used to stamp owner references.
    #[serde(default)]
    pub uid: Option<String>,
    pub desired_replicas: u32,
    /// Opaque unit template. `metadata.labels` (if any) seed the labels of created units.
    #[serde(default)]
    pub unit_template: serde_json::Value,
    #[serde(default)]
    pub selector_labels: Labels,
    /// Last status persisted by the store.
    #[serde(default)]
    pub status: GroupStatus,
}

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

impl DesiredState {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Owner reference that units created for this state carry.
    pub fn owner_ref(&self) -> OwnerRef {
        OwnerRef { kind: self.kind.clone(), name: self.name.clone(), uid: self.uid.clone() }
    }

    /// Labels of the template, overlaid with the selector (selector wins).
    pub fn unit_labels(&self) -> Labels {
        let mut labels: Labels = self
            .unit_template
            .pointer("/metadata/labels")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        for (k, v) in &self.selector_labels {
            labels.insert(k.clone(), v.clone());
        }
        labels
    }
}

/// Persisted status of a DesiredState.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub observed_replicas: u32,
}

/// Back-reference from a unit to the object that manages it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    /// Carried through to the store; ownership matching ignores it.
    #[serde(default)]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    /// Pending and Running units count toward the live replica count.
    pub fn is_live(self) -> bool {
        matches!(self, UnitPhase::Pending | UnitPhase::Running)
    }

    /// Maps a reported phase string; no report at all means the unit is still Pending.
    pub fn from_reported(phase: Option<&str>) -> Self {
        match phase {
            None => UnitPhase::Pending,
            Some("Pending") => UnitPhase::Pending,
            Some("Running") => UnitPhase::Running,
            Some("Succeeded") => UnitPhase::Succeeded,
            Some("Failed") => UnitPhase::Failed,
            Some(_) => UnitPhase::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitPhase::Pending => "Pending",
            UnitPhase::Running => "Running",
            UnitPhase::Succeeded => "Succeeded",
            UnitPhase::Failed => "Failed",
            UnitPhase::Unknown => "Unknown",
        }
    }
}

/// Read-only snapshot of one unit as reported by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedUnit {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub owner_references: SmallVec<[OwnerRef; 1]>,
    pub creation_timestamp: DateTime<Utc>,
    pub phase: UnitPhase,
}

impl ObservedUnit {
    pub fn unit_ref(&self) -> UnitRef {
        UnitRef { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

/// Address of a unit for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Fully specified unit handed to the store's `create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUnit {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub owner: OwnerRef,
    pub template: serde_json::Value,
}

/// One mutating step computed by the diff engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Create one unit from the template; the name is chosen at execution time.
    Create,
    Delete(UnitRef),
}

impl Action {
    pub fn verb(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Delete(_) => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Delete(u) => write!(f, "delete {}", u),
        }
    }
}

/// An action that failed, with the target it was aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub action: Action,
    /// Unit name the action targeted (generated name for creates).
    pub target: String,
    pub error: StoreError,
}

impl fmt::Display for ActionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for {}: {}", self.action.verb(), self.target, self.error)
    }
}

/// Result of applying one pass's action list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub created_count: u32,
    pub deleted_count: u32,
    pub failures: Vec<ActionFailure>,
    pub final_owned_count: u32,
    /// The pass was interrupted between actions.
    pub cancelled: bool,
}

impl ReconcileOutcome {
    pub fn first_failure(&self) -> Option<&ActionFailure> {
        self.failures.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    Unknown,
    False,
    True,
}

impl ConditionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionStatus::Unknown => "Unknown",
            ConditionStatus::False => "False",
            ConditionStatus::True => "True",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

pub mod prelude {
    pub use super::{
        Action, ActionFailure, Condition, ConditionStatus, DesiredState, GroupStatus, Labels, NewUnit, ObjectKey,
        ObservedUnit, OwnerRef, ReconcileOutcome, StoreError, UnitPhase, UnitRef,
    };
}
