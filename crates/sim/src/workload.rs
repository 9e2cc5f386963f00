//! Replicated workloads: ordinal Pods `<name>-<i>` and per-ordinal claims
//! `<claim>-<name>-<i>`, with ready counts tracking the Pods.

use kube::core::DynamicObject;
use rekon_core::object::{is_deleting, object_ref_of, spec};
use rekon_core::{kinds, ObjectType, Result};
use rekon_kubehub::ObjectClient;
use serde_json::{json, Value};
use tracing::debug;

use crate::util::{apply_child, child, controlled_by, int_at, is_pod_ready, patch_status, Labels};
use crate::Simulator;

pub struct InstanceSetSimulator;
pub struct StatefulSetSimulator;

#[async_trait::async_trait]
impl Simulator for InstanceSetSimulator {
    fn name(&self) -> &'static str {
        "instanceset"
    }

    fn object_type(&self) -> ObjectType {
        kinds::instance_set()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        reconcile_workload(client, obj).await
    }
}

#[async_trait::async_trait]
impl Simulator for StatefulSetSimulator {
    fn name(&self) -> &'static str {
        "statefulset"
    }

    fn object_type(&self) -> ObjectType {
        kinds::stateful_set()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        reconcile_workload(client, obj).await
    }
}

fn labels_at(v: Option<&Value>) -> Labels {
    v.and_then(|l| serde_json::from_value(l.clone()).ok()).unwrap_or_default()
}

fn ordinal(workload: &str, pod: &DynamicObject) -> Option<i64> {
    pod.metadata.name.as_deref()?.strip_prefix(workload)?.strip_prefix('-')?.parse().ok()
}

async fn reconcile_workload(client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
    if is_deleting(obj) {
        return Ok(());
    }
    let name = obj.metadata.name.clone().unwrap_or_default();
    let empty = json!({});
    let spec = spec(obj).unwrap_or(&empty);
    let replicas = int_at(spec.get("replicas"), 1).max(0);
    let selector = labels_at(spec.pointer("/selector/matchLabels"));
    let mut pod_labels = labels_at(spec.pointer("/template/metadata/labels"));
    pod_labels.extend(selector.clone());
    let pod_spec = spec.pointer("/template/spec").cloned().unwrap_or_else(|| json!({}));
    let claims = spec.get("volumeClaimTemplates").and_then(Value::as_array).cloned().unwrap_or_default();

    for i in 0..replicas {
        for claim in &claims {
            let Some(claim_name) = claim.pointer("/metadata/name").and_then(Value::as_str) else {
                continue;
            };
            let mut pvc = child(&kinds::pvc(), obj, &format!("{claim_name}-{name}-{i}"), selector.clone(), false)?;
            pvc.data = json!({"spec": claim.get("spec").cloned().unwrap_or_else(|| json!({}))});
            apply_child(client, pvc).await?;
        }
        let mut pod = child(&kinds::pod(), obj, &format!("{name}-{i}"), pod_labels.clone(), true)?;
        pod.data = json!({"spec": pod_spec});
        apply_child(client, pod).await?;
    }

    let mut ready = 0i64;
    let mut current = 0i64;
    for pod in controlled_by(client, &kinds::pod(), obj).await? {
        match ordinal(&name, &pod) {
            Some(i) if i >= replicas => {
                debug!(pod = ?pod.metadata.name, "sim: scale down");
                client.delete(&object_ref_of(&pod)?).await?;
            }
            _ if is_deleting(&pod) => {}
            _ => {
                current += 1;
                if is_pod_ready(&pod) {
                    ready += 1;
                }
            }
        }
    }

    let status = json!({
        "observedGeneration": obj.metadata.generation.unwrap_or(0),
        "replicas": current,
        "readyReplicas": ready,
        "availableReplicas": ready,
        "currentReplicas": current,
        "updatedReplicas": current,
    });
    patch_status(client, obj, status).await
}
