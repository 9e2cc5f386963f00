//! Owner-reference garbage collection and completion of finalizer-free deletes.

use kube::core::DynamicObject;
use rekon_core::object::{has_finalizers, is_deleting, object_ref_of};
use rekon_core::{kinds, ObjectRef, ObjectType, Result};
use rekon_kubehub::ObjectClient;
use tracing::debug;

use crate::util::get_optional;
use crate::Simulator;

/// Completes deletion of objects whose finalizers are gone, and deletes objects
/// whose owners have all disappeared.
pub struct GarbageCollector {
    ty: ObjectType,
}

impl GarbageCollector {
    pub fn new(ty: ObjectType) -> Self {
        Self { ty }
    }
}

#[async_trait::async_trait]
impl Simulator for GarbageCollector {
    fn name(&self) -> &'static str {
        "garbage-collector"
    }

    fn object_type(&self) -> ObjectType {
        self.ty.clone()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        let key = object_ref_of(obj)?;
        if is_deleting(obj) {
            if !has_finalizers(obj) {
                client.delete(&key).await?;
            }
            return Ok(());
        }
        let owners = obj.metadata.owner_references.as_deref().unwrap_or_default();
        if owners.is_empty() {
            return Ok(());
        }
        for owner in owners {
            let ty = ObjectType::new(&owner.api_version, &owner.kind);
            let ns = if kinds::is_cluster_scoped(&ty) { String::new() } else { key.namespace.clone() };
            let owner_key = ObjectRef::new(ty, ns, owner.name.clone());
            if let Some(found) = get_optional(client, &owner_key).await? {
                if owner.uid.is_empty() || found.metadata.uid.as_deref() == Some(owner.uid.as_str()) {
                    return Ok(());
                }
            }
        }
        debug!(obj = %key, "sim: owners gone, collecting");
        client.delete(&key).await
    }
}
