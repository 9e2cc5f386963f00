//! Stand-in for the real cluster when planning from files only.

use kube::core::DynamicObject;
use rekon_core::{Error, ObjectPatch, ObjectRef, ObjectType, Result};
use rekon_kubehub::{ListOptions, ObjectClient};

/// Reads see an empty cluster; writes are rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineClient;

fn refused(what: &str) -> Error {
    Error::Internal(format!("offline: {what} is not available without a cluster"))
}

#[async_trait::async_trait]
impl ObjectClient for OfflineClient {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        Err(Error::NotFound(key.to_string()))
    }

    async fn list(&self, _: &ObjectType, _: &ListOptions) -> Result<Vec<DynamicObject>> {
        Ok(Vec::new())
    }

    async fn create(&self, _: &DynamicObject) -> Result<DynamicObject> {
        Err(refused("create"))
    }

    async fn update(&self, _: &DynamicObject) -> Result<DynamicObject> {
        Err(refused("update"))
    }

    async fn patch(&self, _: &ObjectRef, _: &ObjectPatch) -> Result<DynamicObject> {
        Err(refused("patch"))
    }

    async fn delete(&self, _: &ObjectRef) -> Result<()> {
        Err(refused("delete"))
    }

    async fn update_status(&self, _: &DynamicObject) -> Result<DynamicObject> {
        Err(refused("update_status"))
    }

    async fn patch_status(&self, _: &ObjectRef, _: &ObjectPatch) -> Result<DynamicObject> {
        Err(refused("patch_status"))
    }
}
