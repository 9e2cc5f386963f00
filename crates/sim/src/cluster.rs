//! Cluster and Component controllers.

use std::collections::BTreeSet;

use kube::core::DynamicObject;
use rekon_core::object::{is_deleting, label, object_ref_of, spec, status};
use rekon_core::{kinds, ObjectRef, ObjectType, Result};
use rekon_kubehub::ObjectClient;
use rekon_mock::{EventRecorder, EVENT_TYPE_NORMAL};
use serde_json::{json, Value};
use tracing::debug;

use crate::util::{
    apply_child, child, controlled_by, ensure_finalizer, get_optional, int_at, labels, patch_status, remove_finalizer, str_at,
};
use crate::Simulator;

const PHASE_CREATING: &str = "Creating";
const PHASE_UPDATING: &str = "Updating";
const PHASE_RUNNING: &str = "Running";
const PHASE_FAILED: &str = "Failed";
const PHASE_DELETING: &str = "Deleting";

/// Creating until first Running, Updating on later transitions.
fn progress_phase(previous: Option<&str>) -> &'static str {
    match previous {
        None | Some(PHASE_CREATING) => PHASE_CREATING,
        _ => PHASE_UPDATING,
    }
}

/// Delete every child that is not already going away; true once none are left.
async fn drain_children(client: &dyn ObjectClient, owner: &DynamicObject, types: &[ObjectType]) -> Result<bool> {
    let mut left = 0usize;
    for ty in types {
        for c in controlled_by(client, ty, owner).await? {
            left += 1;
            if !is_deleting(&c) {
                client.delete(&object_ref_of(&c)?).await?;
            }
        }
    }
    Ok(left == 0)
}

async fn finish_deletion(client: &dyn ObjectClient, obj: &DynamicObject, children: &[ObjectType]) -> Result<()> {
    if drain_children(client, obj, children).await? {
        debug!(obj = ?obj.metadata.name, "sim: children gone, releasing finalizer");
        remove_finalizer(client, obj).await
    } else {
        patch_status(client, obj, json!({"phase": PHASE_DELETING})).await
    }
}

/// Expands `spec.componentSpecs` into Component objects named `<cluster>-<name>` and
/// aggregates their phases.
pub struct ClusterSimulator {
    recorder: EventRecorder,
}

impl Default for ClusterSimulator {
    fn default() -> Self {
        Self { recorder: EventRecorder::new("cluster-controller") }
    }
}

#[async_trait::async_trait]
impl Simulator for ClusterSimulator {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn object_type(&self) -> ObjectType {
        kinds::cluster()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) {
            return finish_deletion(client, obj, &[kinds::component()]).await;
        }
        ensure_finalizer(client, obj).await?;
        let cluster = obj.metadata.name.clone().unwrap_or_default();
        let specs = spec(obj).and_then(|s| s.get("componentSpecs")).and_then(Value::as_array).cloned().unwrap_or_default();

        let mut wanted = BTreeSet::new();
        for cs in &specs {
            let Some(short) = cs.get("name").and_then(Value::as_str) else {
                continue;
            };
            let full = format!("{cluster}-{short}");
            let l = labels([
                (kinds::LABEL_INSTANCE, cluster.as_str()),
                (kinds::LABEL_MANAGED_BY, kinds::MANAGED_BY_APP),
                (kinds::LABEL_COMPONENT_NAME, short),
            ]);
            let mut comp = child(&kinds::component(), obj, &full, l, true)?;
            let mut comp_spec = cs.clone();
            if let Some(m) = comp_spec.as_object_mut() {
                m.remove("name");
            }
            comp.data = json!({ "spec": comp_spec });
            apply_child(client, comp).await?;
            wanted.insert(full);
        }

        let mut phases = serde_json::Map::new();
        let mut all_running = true;
        let mut failed = false;
        for comp in controlled_by(client, &kinds::component(), obj).await? {
            let name = comp.metadata.name.clone().unwrap_or_default();
            if !wanted.contains(&name) {
                if !is_deleting(&comp) {
                    client.delete(&object_ref_of(&comp)?).await?;
                }
                continue;
            }
            let phase = str_at(&comp, "status", "phase");
            all_running &= phase == Some(PHASE_RUNNING);
            failed |= phase == Some(PHASE_FAILED);
            let short = label(&comp, kinds::LABEL_COMPONENT_NAME).unwrap_or(name.as_str()).to_string();
            phases.insert(short, json!({ "phase": phase }));
        }
        let previous = str_at(obj, "status", "phase");
        let phase = if failed {
            PHASE_FAILED
        } else if all_running && phases.len() == wanted.len() {
            PHASE_RUNNING
        } else {
            progress_phase(previous)
        };
        let status = json!({
            "phase": phase,
            "observedGeneration": obj.metadata.generation.unwrap_or(0),
            "components": phases,
        });
        patch_status(client, obj, status).await?;
        if phase == PHASE_RUNNING {
            self.recorder.record(client, obj, EVENT_TYPE_NORMAL, "ClusterReady", "cluster is running").await?;
        }
        Ok(())
    }
}

/// Turns a Component into an InstanceSet plus a headless Service and reports
/// Running once every replica is ready.
pub struct ComponentSimulator {
    recorder: EventRecorder,
}

impl Default for ComponentSimulator {
    fn default() -> Self {
        Self { recorder: EventRecorder::new("component-controller") }
    }
}

#[async_trait::async_trait]
impl Simulator for ComponentSimulator {
    fn name(&self) -> &'static str {
        "component"
    }

    fn object_type(&self) -> ObjectType {
        kinds::component()
    }

    async fn reconcile(&self, client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
        if is_deleting(obj) {
            return finish_deletion(client, obj, &[kinds::instance_set(), kinds::service()]).await;
        }
        ensure_finalizer(client, obj).await?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let instance = label(obj, kinds::LABEL_INSTANCE).unwrap_or_default().to_string();
        let short = label(obj, kinds::LABEL_COMPONENT_NAME).unwrap_or(name.as_str()).to_string();
        let empty = json!({});
        let spec = spec(obj).unwrap_or(&empty);
        let replicas = int_at(spec.get("replicas"), 1);

        let owned = labels([
            (kinds::LABEL_INSTANCE, instance.as_str()),
            (kinds::LABEL_MANAGED_BY, kinds::MANAGED_BY_APP),
            (kinds::LABEL_COMPONENT_NAME, short.as_str()),
        ]);
        let selector = labels([
            (kinds::LABEL_INSTANCE, instance.as_str()),
            (kinds::LABEL_COMPONENT_NAME, short.as_str()),
            (kinds::LABEL_WORKLOAD_MANAGED_BY, "InstanceSet"),
            (kinds::LABEL_WORKLOAD_INSTANCE, name.as_str()),
        ]);
        let mut container = json!({ "name": short });
        if let Some(resources) = spec.get("resources") {
            container["resources"] = resources.clone();
        }
        if let Some(version) = spec.get("serviceVersion") {
            container["env"] = json!([{ "name": "SERVICE_VERSION", "value": version }]);
        }
        let claims: Vec<Value> = spec
            .get("volumeClaimTemplates")
            .and_then(Value::as_array)
            .map(|v| v.iter().map(|c| json!({ "metadata": { "name": c["name"] }, "spec": c["spec"] })).collect())
            .unwrap_or_default();

        let mut its = child(&kinds::instance_set(), obj, &name, owned.clone(), true)?;
        its.data = json!({ "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": selector },
            "template": { "metadata": { "labels": selector }, "spec": { "containers": [container] } },
            "volumeClaimTemplates": claims,
        }});
        apply_child(client, its).await?;

        let mut svc = child(&kinds::service(), obj, &format!("{name}-headless"), owned, true)?;
        svc.data = json!({ "spec": { "clusterIP": "None", "selector": selector } });
        apply_child(client, svc).await?;

        let its_key = ObjectRef::new(kinds::instance_set(), obj.metadata.namespace.clone().unwrap_or_default(), name.clone());
        let ready = match get_optional(client, &its_key).await? {
            Some(its) => {
                let st = status(&its);
                let observed = int_at(st.and_then(|s| s.get("observedGeneration")), 0);
                observed == its.metadata.generation.unwrap_or(0)
                    && int_at(st.and_then(|s| s.get("readyReplicas")), 0) >= replicas
            }
            None => false,
        };
        let phase = if ready { PHASE_RUNNING } else { progress_phase(str_at(obj, "status", "phase")) };
        let status = json!({ "phase": phase, "observedGeneration": obj.metadata.generation.unwrap_or(0) });
        patch_status(client, obj, status).await?;
        if ready {
            self.recorder.record(client, obj, EVENT_TYPE_NORMAL, "ComponentReady", "component is running").await?;
        }
        Ok(())
    }
}
