//! Helpers over `DynamicObject`, the single object representation used by the
//! stores, the clients and the simulators.

use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::{json, Value};

use crate::{Error, EventAttributes, ObjectRef, ObjectType, Result};

pub fn object_type_of(obj: &DynamicObject) -> Result<ObjectType> {
    match &obj.types {
        Some(t) if !t.api_version.is_empty() && !t.kind.is_empty() => Ok(ObjectType::new(&t.api_version, &t.kind)),
        _ => Err(Error::Malformed(format!(
            "object {} has no apiVersion/kind",
            obj.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))),
    }
}

pub fn object_ref_of(obj: &DynamicObject) -> Result<ObjectRef> {
    let object_type = object_type_of(obj)?;
    let name = obj
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::Malformed(format!("{object_type} object has no metadata.name")))?;
    Ok(ObjectRef::new(object_type, obj.metadata.namespace.clone().unwrap_or_default(), name))
}

/// Empty object of the given type; `data` starts as `{}`.
pub fn new_object(ty: &ObjectType, namespace: &str, name: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: ty.api_version.clone(), kind: ty.kind.clone() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: if namespace.is_empty() { None } else { Some(namespace.to_string()) },
            ..Default::default()
        },
        data: json!({}),
    }
}

/// Parse a resourceVersion as a revision; unparsable or absent is 0.
pub fn parse_revision(resource_version: Option<&str>) -> i64 {
    resource_version.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0)
}

pub fn revision_of(obj: &DynamicObject) -> i64 {
    parse_revision(obj.metadata.resource_version.as_deref())
}

pub fn object_reference(obj: &DynamicObject) -> Result<ObjectReference> {
    let r = object_ref_of(obj)?;
    Ok(r.to_reference(obj.metadata.uid.clone(), obj.metadata.resource_version.clone()))
}

pub fn spec(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("spec")
}

pub fn status(obj: &DynamicObject) -> Option<&Value> {
    obj.data.get("status")
}

/// Mutable `data.<section>`, reset to `{}` when absent or not an object, so
/// callers can assign with `section_mut(&mut o, "status")["phase"] = ...`.
pub fn section_mut<'a>(obj: &'a mut DynamicObject, section: &str) -> &'a mut Value {
    if !obj.data.is_object() {
        obj.data = json!({});
    }
    let entry = &mut obj.data[section];
    if !entry.is_object() {
        *entry = json!({});
    }
    entry
}

pub fn owner_reference(owner: &DynamicObject, controller: bool) -> Result<OwnerReference> {
    let r = object_ref_of(owner)?;
    Ok(OwnerReference {
        api_version: r.object_type.api_version,
        kind: r.object_type.kind,
        name: r.name,
        uid: owner.metadata.uid.clone().unwrap_or_default(),
        controller: Some(controller),
        block_owner_deletion: Some(true),
    })
}

/// Whether `obj` lists an owner reference with `owner_uid`, optionally requiring it to be the controller.
pub fn is_owned_by(obj: &DynamicObject, owner_uid: &str, require_controller: bool) -> bool {
    obj.metadata.owner_references.as_deref().unwrap_or_default().iter().any(|o| {
        o.uid == owner_uid && (!require_controller || o.controller.unwrap_or(false))
    })
}

pub fn is_deleting(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizers(obj: &DynamicObject) -> bool {
    obj.metadata.finalizers.as_ref().map_or(false, |f| !f.is_empty())
}

pub fn label<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
}

/// The involved object and attributes of a core/v1 Event.
pub fn event_parts(event: &DynamicObject) -> Result<(ObjectReference, EventAttributes)> {
    let involved = event
        .data
        .get("involvedObject")
        .cloned()
        .ok_or_else(|| Error::Malformed("event has no involvedObject".into()))?;
    let reference: ObjectReference = serde_json::from_value(involved)?;
    let field = |k: &str| event.data.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
    let attrs = EventAttributes {
        name: event.metadata.name.clone().unwrap_or_default(),
        type_: field("type"),
        reason: field("reason"),
    };
    Ok((reference, attrs))
}

pub fn event_message(event: &DynamicObject) -> &str {
    event.data.get("message").and_then(Value::as_str).unwrap_or_default()
}
