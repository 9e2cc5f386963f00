//! `ObjectClient` over a live cluster via kube-rs dynamic APIs.

use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use metrics::counter;
use rekon_core::{object::object_ref_of, Error, ObjectPatch, ObjectRef, ObjectType, Result};
use rustc_hash::FxHashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{DiscoveredResource, ListOptions, ObjectClient};

static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide kube client from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    KUBE_CLIENT.get_or_try_init(Client::try_default).await.cloned().map_err(Error::from)
}

pub struct KubeClient {
    client: Client,
    resources: FxHashMap<ObjectType, (ApiResource, bool)>,
}

impl KubeClient {
    pub fn with_resources(client: Client, discovered: &[DiscoveredResource]) -> Self {
        let resources = discovered
            .iter()
            .map(|d| (d.object_type(), (d.api_resource(), d.namespaced)))
            .collect();
        Self { client, resources }
    }

    pub fn served(&self) -> impl Iterator<Item = &ObjectType> {
        self.resources.keys()
    }

    fn api(&self, ty: &ObjectType, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self
            .resources
            .get(ty)
            .ok_or_else(|| Error::NotFound(format!("type {ty} is not served by the cluster")))?;
        Ok(match namespace.filter(|ns| *namespaced && !ns.is_empty()) {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        })
    }

    fn api_for(&self, key: &ObjectRef) -> Result<Api<DynamicObject>> {
        self.api(&key.object_type, key.namespace())
    }
}

fn kube_patch(p: &ObjectPatch) -> Result<Patch<serde_json::Value>> {
    Ok(match p {
        ObjectPatch::Merge(v) => Patch::Merge(v.clone()),
        ObjectPatch::Strategic(v) => Patch::Strategic(v.clone()),
        ObjectPatch::Json(v) => Patch::Json(
            serde_json::from_value::<json_patch::Patch>(v.clone())
                .map_err(|e| Error::Malformed(format!("invalid JSON patch: {e}")))?,
        ),
    })
}

#[async_trait::async_trait]
impl ObjectClient for KubeClient {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        Ok(self.api_for(key)?.get(&key.name).await?)
    }

    async fn list(&self, ty: &ObjectType, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        let api = self.api(ty, opts.namespace.as_deref())?;
        let mut lp = ListParams::default();
        if let Some(sel) = opts.label_selector() {
            lp = lp.labels(&sel);
        }
        let list = api.list(&lp).await?;
        debug!(ty = %ty, count = list.items.len(), "kube: list");
        // the API omits apiVersion/kind on list items
        Ok(list
            .items
            .into_iter()
            .map(|mut o| {
                if o.types.is_none() {
                    o.types = Some(kube::core::TypeMeta { api_version: ty.api_version.clone(), kind: ty.kind.clone() });
                }
                o
            })
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        counter!("kube_writes_total", 1u64, "op" => "create");
        Ok(self.api_for(&key)?.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        counter!("kube_writes_total", 1u64, "op" => "update");
        Ok(self.api_for(&key)?.replace(&key.name, &PostParams::default(), obj).await?)
    }

    async fn patch(&self, key: &ObjectRef, patch: &ObjectPatch) -> Result<DynamicObject> {
        counter!("kube_writes_total", 1u64, "op" => "patch");
        Ok(self.api_for(key)?.patch(&key.name, &PatchParams::default(), &kube_patch(patch)?).await?)
    }

    async fn delete(&self, key: &ObjectRef) -> Result<()> {
        counter!("kube_writes_total", 1u64, "op" => "delete");
        match self.api_for(key)?.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() { Ok(()) } else { Err(err) }
            }
        }
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        let body = serde_json::to_vec(obj)?;
        counter!("kube_writes_total", 1u64, "op" => "update_status");
        Ok(self.api_for(&key)?.replace_status(&key.name, &PostParams::default(), body).await?)
    }

    async fn patch_status(&self, key: &ObjectRef, patch: &ObjectPatch) -> Result<DynamicObject> {
        counter!("kube_writes_total", 1u64, "op" => "patch_status");
        Ok(self.api_for(key)?.patch_status(&key.name, &PatchParams::default(), &kube_patch(patch)?).await?)
    }
}
