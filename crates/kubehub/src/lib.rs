//! Rekon kubehub: the object CRUD seam shared by the real API client and the mock,
//! API discovery and the watch-event source.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::core::DynamicObject;
use rekon_core::{ObjectPatch, ObjectRef, ObjectType, Result};

mod client;
mod discovery;
mod events;

pub use client::{get_kube_client, KubeClient};
pub use discovery::{discover, ApiDiscovery, DiscoveredResource, ServedTypes};
pub use events::{resolve_involved_object, start_watcher, ObjectEvent};

/// Namespace and equality label selector for `list`. An empty namespace lists
/// across all namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListOptions {
    pub fn in_namespace(ns: impl Into<String>) -> Self {
        Self { namespace: Some(ns.into()), labels: BTreeMap::new() }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// `k1=v1,k2=v2`, the wire form of an equality selector.
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if let Some(ns) = self.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            if obj.metadata.namespace.as_deref().unwrap_or("") != ns {
                return false;
            }
        }
        let labels = obj.metadata.labels.as_ref();
        self.labels.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

/// CRUD surface over untyped objects. Status methods touch only the status
/// subresource.
#[async_trait::async_trait]
pub trait ObjectClient: Send + Sync {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject>;
    async fn list(&self, ty: &ObjectType, opts: &ListOptions) -> Result<Vec<DynamicObject>>;
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn patch(&self, key: &ObjectRef, patch: &ObjectPatch) -> Result<DynamicObject>;
    async fn delete(&self, key: &ObjectRef) -> Result<()>;
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject>;
    async fn patch_status(&self, key: &ObjectRef, patch: &ObjectPatch) -> Result<DynamicObject>;
}
