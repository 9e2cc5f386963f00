//! Rekon core types: object identity, change records and dry-run results.
//!
//! Everything that crosses a crate boundary in the simulator lives here so the
//! stores, the rule engine and the plan generator agree on one vocabulary.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::GroupVersionKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod kinds;
pub mod object;

pub use error::{Error, Result};

pub mod prelude {
    pub use super::{
        ChangeType, DryRunPhase, DryRunResult, EventAttributes, ObjectChange, ObjectPatch, ObjectRef,
        ObjectSummary, ObjectTreeNode, ObjectType, Plan,
    };
    pub use super::{Error, Result};
}

/// API type of an object: `apiVersion` + `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectType {
    pub api_version: String,
    pub kind: String,
}

impl ObjectType {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn group(&self) -> &str {
        self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version.split_once('/').map(|(_, v)| v).unwrap_or(&self.api_version)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(self.group(), self.version(), &self.kind)
    }

    /// `"<apiVersion>/<kind>"`, e.g. `apps/v1/StatefulSet` or `v1/Pod`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.api_version, self.kind)
    }

    /// Parse a key produced by [`ObjectType::key`].
    pub fn parse_key(key: &str) -> Result<Self> {
        match key.rsplit_once('/') {
            Some((api_version, kind)) if !api_version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(api_version, kind))
            }
            _ => Err(Error::Malformed(format!("invalid type key: {key} (expect v1/Kind or group/v1/Kind)"))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<&GroupVersionKind> for ObjectType {
    fn from(gvk: &GroupVersionKind) -> Self {
        let api_version = if gvk.group.is_empty() { gvk.version.clone() } else { format!("{}/{}", gvk.group, gvk.version) };
        Self { api_version, kind: gvk.kind.clone() }
    }
}

/// Canonical identity of an object. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(object_type: ObjectType, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { object_type, namespace: namespace.into(), name: name.into() }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }

    pub fn to_reference(&self, uid: Option<String>, resource_version: Option<String>) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.object_type.api_version.clone()),
            kind: Some(self.object_type.kind.clone()),
            namespace: self.namespace().map(str::to_string),
            name: Some(self.name.clone()),
            uid,
            resource_version,
            ..Default::default()
        }
    }

    pub fn from_reference(reference: &ObjectReference) -> Self {
        Self {
            object_type: ObjectType::new(
                reference.api_version.clone().unwrap_or_default(),
                reference.kind.clone().unwrap_or_default(),
            ),
            namespace: reference.namespace.clone().unwrap_or_default(),
            name: reference.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace() {
            Some(ns) => write!(f, "{} {}/{}", self.object_type, ns, self.name),
            None => write!(f, "{} {}", self.object_type, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum ChangeType {
    Creation,
    Update,
    Deletion,
    Event,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Creation => "Creation",
            ChangeType::Update => "Update",
            ChangeType::Deletion => "Deletion",
            ChangeType::Event => "Event",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventAttributes {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub reason: String,
}

/// One observed mutation. Ordered by `revision`; the timestamp is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectChange {
    pub object_reference: ObjectReference,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_attributes: Option<EventAttributes>,
    pub revision: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Time>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectTreeNode {
    pub primary: ObjectReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondaries: Vec<ObjectTreeNode>,
}

impl ObjectTreeNode {
    pub fn new(primary: ObjectReference) -> Self {
        Self { primary, secondaries: Vec::new() }
    }

    /// Stable ordering key: kind, namespace, name, apiVersion.
    pub fn sort_key(&self) -> String {
        let p = &self.primary;
        [&p.kind, &p.namespace, &p.name, &p.api_version]
            .iter()
            .map(|s| s.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .concat()
    }

    pub fn sort_secondaries(&mut self) {
        self.secondaries.sort_by_cached_key(|n| n.sort_key());
    }

    /// Number of nodes in this subtree, including self.
    pub fn node_count(&self) -> usize {
        1 + self.secondaries.iter().map(ObjectTreeNode::node_count).sum::<usize>()
    }

    /// Depth-first walk over all node references.
    pub fn references(&self) -> Vec<&ObjectReference> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            out.push(&node.primary);
            stack.extend(node.secondaries.iter().rev());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectChangeSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub object_type: ObjectType,
    pub total: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<ObjectChangeSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum DryRunPhase {
    Succeeded,
    Failed,
}

/// Outcome of one simulated reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_tree: Option<ObjectTreeNode>,
    #[serde(default)]
    pub changes: Vec<ObjectChange>,
    #[serde(default)]
    pub summary: Vec<ObjectSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DryRunResult {
    pub phase: DryRunPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub observed_target_generation: i64,
    #[serde(default)]
    pub spec_diff: String,
    #[serde(default)]
    pub desired_spec_revision: String,
    #[serde(default)]
    pub plan: Plan,
}

impl DryRunResult {
    pub fn failed(reason: &str, message: impl Into<String>) -> Self {
        Self {
            phase: DryRunPhase::Failed,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            observed_target_generation: 0,
            spec_diff: String::new(),
            desired_spec_revision: String::new(),
            plan: Plan::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.phase == DryRunPhase::Succeeded
    }
}

/// Patch body understood by the object clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectPatch {
    /// RFC 7386 JSON merge patch.
    Merge(serde_json::Value),
    /// Kubernetes strategic merge patch.
    Strategic(serde_json::Value),
    /// RFC 6902 JSON patch (array of operations).
    Json(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_type_splits_group_and_version() {
        let t = ObjectType::new("apps/v1", "StatefulSet");
        assert_eq!(t.group(), "apps");
        assert_eq!(t.version(), "v1");
        assert_eq!(t.key(), "apps/v1/StatefulSet");
        let core = ObjectType::new("v1", "Pod");
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
        assert_eq!(ObjectType::parse_key("apps.kubeblocks.io/v1/Cluster").unwrap(), ObjectType::new("apps.kubeblocks.io/v1", "Cluster"));
        assert!(ObjectType::parse_key("Pod").is_err());
    }

    #[test]
    fn reference_round_trip() {
        let r = ObjectRef::new(ObjectType::new("v1", "PersistentVolume"), "", "pv-0");
        let reference = r.to_reference(Some("u".into()), Some("7".into()));
        assert_eq!(reference.namespace, None);
        assert_eq!(ObjectRef::from_reference(&reference), r);
    }

    #[test]
    fn tree_sort_key_orders_by_kind_first() {
        let mk = |kind: &str, name: &str| {
            ObjectTreeNode::new(ObjectRef::new(ObjectType::new("v1", kind), "ns", name).to_reference(None, None))
        };
        let mut root = mk("Cluster", "c");
        root.secondaries = vec![mk("Service", "a"), mk("Component", "z"), mk("Component", "b")];
        root.sort_secondaries();
        let names: Vec<_> = root.secondaries.iter().map(|n| n.primary.name.clone().unwrap()).collect();
        assert_eq!(names, vec!["b", "z", "a"]);
        assert_eq!(root.node_count(), 4);
        assert_eq!(root.references().len(), 4);
    }
}
