//! Rekon apply: object normalization, patch application and field-level diffs.
//!
//! Everything here is pure; the mock client and the stores call into it to decide
//! whether a write is observable and to compute the next stored object.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context};
use kube::core::DynamicObject;
use metrics::counter;
use rekon_core::{Error, ObjectPatch, Result};
use serde::Deserialize;
use serde_json::Value as Json;

mod strategic;

pub use strategic::strategic_merge;

fn max_yaml_bytes() -> usize {
    std::env::var("REKON_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("REKON_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(200_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a multi-document YAML stream into objects. `List` documents are flattened
/// and empty documents skipped.
pub fn load_yaml_objects(yaml: &str) -> anyhow::Result<Vec<DynamicObject>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {idx}"))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document {} too complex (>{} nodes)", idx, max_yaml_nodes()));
        }
        if json.get("kind").and_then(Json::as_str) == Some("List") {
            for item in json.get("items").and_then(Json::as_array).cloned().unwrap_or_default() {
                out.push(to_object(item, idx)?);
            }
        } else {
            out.push(to_object(json, idx)?);
        }
    }
    Ok(out)
}

fn to_object(json: Json, idx: usize) -> anyhow::Result<DynamicObject> {
    if json.get("apiVersion").and_then(Json::as_str).is_none() {
        return Err(anyhow!("YAML document {idx} missing apiVersion"));
    }
    if json.get("kind").and_then(Json::as_str).is_none() {
        return Err(anyhow!("YAML document {idx} missing kind"));
    }
    if json.pointer("/metadata/name").and_then(Json::as_str).is_none() {
        return Err(anyhow!("YAML document {idx} missing metadata.name"));
    }
    serde_json::from_value(json).with_context(|| format!("decoding YAML document {idx} as object"))
}

/// Strip server-assigned and ephemeral fields so equality means "same content".
/// `status` is kept; callers compare it separately.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for k in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "selfLink"] {
            meta.remove(k);
        }
    }
    drop_nulls(&mut v);
    v
}

fn drop_nulls(v: &mut Json) {
    match v {
        Json::Object(map) => {
            map.retain(|_, vv| !vv.is_null());
            map.values_mut().for_each(drop_nulls);
        }
        Json::Array(arr) => arr.iter_mut().for_each(drop_nulls),
        _ => {}
    }
}

pub fn normalize(obj: &DynamicObject) -> Result<Json> {
    Ok(strip_noisy(serde_json::to_value(obj)?))
}

/// Everything in `data` except `status`, normalized. For kinds without a `spec`
/// (ConfigMap, Secret) this is the payload itself.
pub fn desired_state(obj: &DynamicObject) -> Json {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
        map.remove("metadata");
        map.remove("apiVersion");
        map.remove("kind");
    }
    drop_nulls(&mut data);
    data
}

pub fn spec_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    desired_state(old) != desired_state(new)
}

pub fn status_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    let status = |o: &DynamicObject| {
        let mut s = o.data.get("status").cloned().unwrap_or(Json::Null);
        drop_nulls(&mut s);
        s
    };
    status(old) != status(new)
}

/// Controller-relevant metadata: finalizers, owner references, annotations, labels
/// and the deletion timestamp.
pub fn metadata_changed(old: &DynamicObject, new: &DynamicObject) -> bool {
    let (a, b) = (&old.metadata, &new.metadata);
    let empty_if_none = |v: &Option<std::collections::BTreeMap<String, String>>| v.clone().unwrap_or_default();
    a.finalizers.clone().unwrap_or_default() != b.finalizers.clone().unwrap_or_default()
        || a.owner_references.clone().unwrap_or_default() != b.owner_references.clone().unwrap_or_default()
        || empty_if_none(&a.annotations) != empty_if_none(&b.annotations)
        || empty_if_none(&a.labels) != empty_if_none(&b.labels)
        || a.deletion_timestamp != b.deletion_timestamp
}

/// Apply a patch to a copy of `base`. Identity fields (type, name, namespace) cannot
/// be changed by a patch.
pub fn apply_patch(base: &DynamicObject, patch: &ObjectPatch) -> Result<DynamicObject> {
    let mut doc = serde_json::to_value(base)?;
    match patch {
        ObjectPatch::Merge(p) => json_patch::merge(&mut doc, p),
        ObjectPatch::Strategic(p) => strategic_merge(&mut doc, p)?,
        ObjectPatch::Json(p) => {
            let ops: json_patch::Patch = serde_json::from_value(p.clone())
                .map_err(|e| Error::Malformed(format!("invalid JSON patch: {e}")))?;
            json_patch::patch(&mut doc, &ops).map_err(|e| Error::Malformed(format!("JSON patch failed: {e}")))?;
        }
    }
    let mut out: DynamicObject = serde_json::from_value(doc)
        .map_err(|e| Error::Malformed(format!("patched object is not a valid object: {e}")))?;
    out.types = base.types.clone();
    out.metadata.name = base.metadata.name.clone();
    out.metadata.namespace = base.metadata.namespace.clone();
    counter!("patch_applied_total", 1u64, "type" => patch_kind(patch));
    Ok(out)
}

fn patch_kind(p: &ObjectPatch) -> &'static str {
    match p {
        ObjectPatch::Merge(_) => "merge",
        ObjectPatch::Strategic(_) => "strategic",
        ObjectPatch::Json(_) => "json",
    }
}

/// Field-level text diff between two spec values, one `-`/`+` line per changed leaf,
/// keyed by dotted path (`componentSpecs[0].replicas`). Unchanged fields are omitted.
pub fn spec_diff(current: &Json, desired: &Json) -> String {
    fn leaf(v: &Json) -> String {
        match v {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
    fn walk(path: &str, a: &Json, b: &Json, out: &mut Vec<String>) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                let mut keys: Vec<&String> = ao.keys().chain(bo.keys()).collect();
                keys.sort();
                keys.dedup();
                for k in keys {
                    let p = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                    walk(&p, ao.get(k).unwrap_or(&Json::Null), bo.get(k).unwrap_or(&Json::Null), out);
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for i in 0..aa.len().max(bb.len()) {
                    let p = format!("{path}[{i}]");
                    walk(&p, aa.get(i).unwrap_or(&Json::Null), bb.get(i).unwrap_or(&Json::Null), out);
                }
            }
            (av, bv) if av == bv => {}
            (av, bv) => {
                if !av.is_null() { out.push(format!("- {path}: {}", leaf(av))); }
                if !bv.is_null() { out.push(format!("+ {path}: {}", leaf(bv))); }
            }
        }
    }
    let mut out = Vec::new();
    walk("", current, desired, &mut out);
    out.join("\n")
}

/// Stable 64-bit FNV-1a hash of the canonical JSON text, hex encoded.
pub fn spec_hash(v: &Json) -> String {
    // serde_json's map is ordered, so the text is canonical
    let text = v.to_string();
    let mut h: u64 = 0xcbf29ce484222325;
    for b in text.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    format!("{h:016x}")
}
