//! Which object types the cluster serves.

use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rekon_core::{ObjectType, Result};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn object_type(&self) -> ObjectType {
        ObjectType::from(&GroupVersionKind::gvk(&self.group, &self.version, &self.kind))
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

/// Served resources (incl. CRDs) across every group version, not just the
/// preferred one, so rules naming an older version still resolve.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for version in group.versions() {
            for (ar, caps) in group.versioned_resources(version) {
                out.push(DiscoveredResource {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    out.dedup();
    Ok(out)
}

pub trait ApiDiscovery {
    fn serves(&self, ty: &ObjectType) -> bool;
}

/// A fixed set of served types.
#[derive(Debug, Clone, Default)]
pub struct ServedTypes(FxHashSet<ObjectType>);

impl ServedTypes {
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromIterator<ObjectType> for ServedTypes {
    fn from_iter<I: IntoIterator<Item = ObjectType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&[DiscoveredResource]> for ServedTypes {
    fn from(found: &[DiscoveredResource]) -> Self {
        found.iter().map(DiscoveredResource::object_type).collect()
    }
}

impl ApiDiscovery for ServedTypes {
    fn serves(&self, ty: &ObjectType) -> bool {
        self.0.contains(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_resources_map_to_object_types() {
        let d = DiscoveredResource {
            group: String::new(),
            version: "v1".into(),
            kind: "Pod".into(),
            plural: "pods".into(),
            namespaced: true,
        };
        assert_eq!(d.object_type(), ObjectType::new("v1", "Pod"));
        assert_eq!(d.api_resource().plural, "pods");
        let served = ServedTypes::from(&[d][..]);
        assert!(served.serves(&ObjectType::new("v1", "Pod")));
        assert!(!served.serves(&ObjectType::new("apps/v1", "Pod")));
    }
}
