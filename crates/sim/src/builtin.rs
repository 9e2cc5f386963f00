//! Stand-ins for the built-in controllers and kubelet.

use kube::core::DynamicObject;
use rekon_core::object::{is_deleting, new_object, object_ref_of, status};
use rekon_core::{kinds, ObjectPatch, ObjectRef, ObjectType, Result};
use rekon_kubehub::ObjectClient;
use serde_json::{json, Value};

use crate::util::{child, get_optional, int_at, labels, patch_status, str_at};
use crate::Simulator;

const POD_PENDING: &str = "Pending";

pub struct PodSimulator;

/// Pods run and report Ready; Pods controlled by a Job run to completion instead.
#[async_trait::async_trait]
impl Simulator for PodSimulator {
    fn name(&self) -> &'static str {
        "pod"
    }

    fn object_type(&self) -> ObjectType {
        kinds::pod()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) {
            return Ok(());
        }
        let phase = str_at(obj, "status", "phase").unwrap_or(POD_PENDING);
        if phase == "Succeeded" || phase == "Failed" {
            return Ok(());
        }
        let batch = obj
            .metadata
            .owner_references
            .iter()
            .flatten()
            .any(|o| o.kind == "Job" && o.controller.unwrap_or(false));
        let status = if batch {
            json!({"phase": "Succeeded", "conditions": [{"type": "Ready", "status": "False", "reason": "PodCompleted"}]})
        } else {
            json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]})
        };
        patch_status(client, obj, status).await
    }
}

pub struct JobSimulator;

/// Runs a single Pod `<job>-0`; the Job succeeds once that Pod has succeeded or
/// is gone after having been started.
#[async_trait::async_trait]
impl Simulator for JobSimulator {
    fn name(&self) -> &'static str {
        "job"
    }

    fn object_type(&self) -> ObjectType {
        kinds::job()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) || int_at(status(obj).and_then(|s| s.get("succeeded")), 0) > 0 {
            return Ok(());
        }
        let name = obj.metadata.name.clone().unwrap_or_default();
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        let pod_key = ObjectRef::new(kinds::pod(), ns, format!("{name}-0"));
        let started = int_at(status(obj).and_then(|s| s.get("active")), 0) > 0;
        let done = json!({
            "active": 0,
            "succeeded": 1,
            "conditions": [{"type": "Complete", "status": "True"}],
        });
        match get_optional(client, &pod_key).await? {
            None if started => patch_status(client, obj, done).await,
            None => {
                let mut pod = child(&kinds::pod(), obj, &pod_key.name, labels([("job-name", name.as_str())]), true)?;
                let template = obj.data.pointer("/spec/template/spec").cloned().unwrap_or_else(|| json!({}));
                pod.data = json!({"spec": template});
                client.create(&pod).await?;
                patch_status(client, obj, json!({"active": 1})).await
            }
            Some(pod) if str_at(&pod, "status", "phase") == Some("Succeeded") => patch_status(client, obj, done).await,
            Some(_) => patch_status(client, obj, json!({"active": 1})).await,
        }
    }
}

pub struct PvcSimulator;

/// Binds every claim to a synthesized volume `<pvc>-pv`.
#[async_trait::async_trait]
impl Simulator for PvcSimulator {
    fn name(&self) -> &'static str {
        "pvc"
    }

    fn object_type(&self) -> ObjectType {
        kinds::pvc()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) || str_at(obj, "status", "phase") == Some("Bound") {
            return Ok(());
        }
        let key = object_ref_of(obj)?;
        let pv_name = str_at(obj, "spec", "volumeName").map(str::to_string).unwrap_or_else(|| format!("{}-pv", key.name));
        let storage = obj.data.pointer("/spec/resources/requests/storage").cloned().unwrap_or(Value::Null);
        let pv_key = ObjectRef::new(kinds::pv(), "", pv_name.clone());
        if get_optional(client, &pv_key).await?.is_none() {
            let mut pv = new_object(&kinds::pv(), "", &pv_name);
            pv.data = json!({"spec": {
                "capacity": {"storage": storage},
                "accessModes": obj.data.pointer("/spec/accessModes").cloned().unwrap_or_else(|| json!(["ReadWriteOnce"])),
                "storageClassName": obj.data.pointer("/spec/storageClassName").cloned().unwrap_or(Value::Null),
                "persistentVolumeReclaimPolicy": "Delete",
                "claimRef": {
                    "apiVersion": "v1",
                    "kind": "PersistentVolumeClaim",
                    "namespace": key.namespace,
                    "name": key.name,
                    "uid": obj.metadata.uid,
                },
            }});
            client.create(&pv).await?;
        }
        if str_at(obj, "spec", "volumeName") != Some(pv_name.as_str()) {
            client.patch(&key, &ObjectPatch::Merge(json!({"spec": {"volumeName": pv_name}}))).await?;
        }
        let bound = json!({"phase": "Bound", "accessModes": obj.data.pointer("/spec/accessModes"), "capacity": {"storage": storage}});
        patch_status(client, obj, bound).await
    }
}

pub struct PvSimulator;

/// Available until claimed, Bound while the claim exists, Released after.
#[async_trait::async_trait]
impl Simulator for PvSimulator {
    fn name(&self) -> &'static str {
        "pv"
    }

    fn object_type(&self) -> ObjectType {
        kinds::pv()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) {
            return Ok(());
        }
        let phase = match obj.data.pointer("/spec/claimRef") {
            Some(claim) if claim.is_object() => {
                let field = |k: &str| claim.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
                let claim_key = ObjectRef::new(kinds::pvc(), field("namespace"), field("name"));
                match get_optional(client, &claim_key).await? {
                    Some(_) => "Bound",
                    None => "Released",
                }
            }
            _ => "Available",
        };
        patch_status(client, obj, json!({"phase": phase})).await
    }
}

/// Becomes `readyToUse` one round after it is first observed.
pub struct VolumeSnapshotSimulator {
    ty: ObjectType,
}

impl VolumeSnapshotSimulator {
    pub fn new(ty: ObjectType) -> Self {
        Self { ty }
    }
}

#[async_trait::async_trait]
impl Simulator for VolumeSnapshotSimulator {
    fn name(&self) -> &'static str {
        "volumesnapshot"
    }

    fn object_type(&self) -> ObjectType {
        self.ty.clone()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) {
            return Ok(());
        }
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        match status(obj).and_then(|s| s.get("readyToUse")).and_then(Value::as_bool) {
            Some(true) => Ok(()),
            Some(false) => patch_status(client, obj, json!({"readyToUse": true})).await,
            None => {
                let status = json!({"readyToUse": false, "boundVolumeSnapshotContentName": format!("snapcontent-{name}")});
                patch_status(client, obj, status).await
            }
        }
    }
}
