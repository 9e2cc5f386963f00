use std::collections::BTreeMap;

use kube::core::DynamicObject;
use rekon_core::object::{is_owned_by, new_object, object_ref_of, owner_reference};
use rekon_core::{kinds, ObjectPatch, ObjectRef, ObjectType, Result};
use rekon_kubehub::{ListOptions, ObjectClient};
use serde_json::{json, Value};

pub(crate) type Labels = BTreeMap<String, String>;

pub(crate) fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// New object in the owner's namespace, controlled by `owner` when given.
pub(crate) fn child(
    ty: &ObjectType,
    owner: &DynamicObject,
    name: &str,
    labels: Labels,
    controlled: bool,
) -> Result<DynamicObject> {
    let ns = owner.metadata.namespace.as_deref().unwrap_or_default();
    let mut o = new_object(ty, ns, name);
    o.metadata.labels = Some(labels);
    if controlled {
        o.metadata.owner_references = Some(vec![owner_reference(owner, true)?]);
    }
    Ok(o)
}

/// Create `desired`, or merge its labels and spec into the existing object.
pub(crate) async fn apply_child(client: &dyn ObjectClient, desired: DynamicObject) -> Result<DynamicObject> {
    let key = object_ref_of(&desired)?;
    match client.get(&key).await {
        Ok(_) => {
            let patch = json!({
                "metadata": {"labels": desired.metadata.labels},
                "spec": desired.data.get("spec").cloned().unwrap_or_else(|| json!({})),
            });
            client.patch(&key, &ObjectPatch::Merge(patch)).await
        }
        Err(e) if e.is_not_found() => client.create(&desired).await,
        Err(e) => Err(e),
    }
}

pub(crate) async fn get_optional(client: &dyn ObjectClient, key: &ObjectRef) -> Result<Option<DynamicObject>> {
    match client.get(key).await {
        Ok(o) => Ok(Some(o)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Merge `status` into the object's status subresource.
pub(crate) async fn patch_status(client: &dyn ObjectClient, obj: &DynamicObject, status: Value) -> Result<()> {
    let key = object_ref_of(obj)?;
    client.patch_status(&key, &ObjectPatch::Merge(json!({ "status": status }))).await?;
    Ok(())
}

/// Objects of `ty` in the owner's namespace whose controller is `owner`.
pub(crate) async fn controlled_by(client: &dyn ObjectClient, ty: &ObjectType, owner: &DynamicObject) -> Result<Vec<DynamicObject>> {
    let uid = owner.metadata.uid.as_deref().unwrap_or_default();
    let opts = ListOptions { namespace: owner.metadata.namespace.clone(), ..Default::default() };
    Ok(client
        .list(ty, &opts)
        .await?
        .into_iter()
        .filter(|o| is_owned_by(o, uid, true))
        .collect())
}

pub(crate) fn has_own_finalizer(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_deref().unwrap_or_default().iter().any(|f| f == kinds::FINALIZER)
}

pub(crate) async fn ensure_finalizer(client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
    if has_own_finalizer(obj) {
        return Ok(());
    }
    let mut finalizers = obj.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(kinds::FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    client.patch(&object_ref_of(obj)?, &ObjectPatch::Merge(patch)).await?;
    Ok(())
}

pub(crate) async fn remove_finalizer(client: &dyn ObjectClient, obj: &DynamicObject) -> Result<()> {
    if !has_own_finalizer(obj) {
        return Ok(());
    }
    let rest: Vec<&String> = obj.metadata.finalizers.iter().flatten().filter(|f| *f != kinds::FINALIZER).collect();
    let value = if rest.is_empty() { Value::Null } else { json!(rest) };
    client.patch(&object_ref_of(obj)?, &ObjectPatch::Merge(json!({"metadata": {"finalizers": value}}))).await?;
    Ok(())
}

pub(crate) fn int_at(v: Option<&Value>, default: i64) -> i64 {
    v.and_then(Value::as_i64).unwrap_or(default)
}

pub(crate) fn str_at<'a>(obj: &'a DynamicObject, section: &str, field: &str) -> Option<&'a str> {
    obj.data.get(section).and_then(|s| s.get(field)).and_then(Value::as_str)
}

pub(crate) fn is_pod_ready(pod: &DynamicObject) -> bool {
    pod.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map_or(false, |c| c.iter().any(|c| c["type"] == "Ready" && c["status"] == "True"))
}
