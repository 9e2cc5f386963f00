//! Strategic merge patch over untyped JSON.
//!
//! Without per-type schemas the merge key is inferred: lists whose elements are all
//! objects carrying `name` merge by name, every other list is replaced. Supported
//! directives: `$patch: delete` on a list element or map, `$patch: replace` on a
//! map, and the informational `$setElementOrder/<field>` keys, which are dropped.

use rekon_core::{Error, Result};
use serde_json::{Map, Value};

const DIRECTIVE: &str = "$patch";
const MERGE_KEY: &str = "name";

pub fn strategic_merge(target: &mut Value, patch: &Value) -> Result<()> {
    match patch {
        Value::Object(p) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(t) = target {
                merge_map(t, p)?;
            }
            Ok(())
        }
        Value::Null => Err(Error::Malformed("strategic merge patch must be an object".into())),
        other => Err(Error::Malformed(format!("strategic merge patch must be an object, got {other}"))),
    }
}

fn merge_map(target: &mut Map<String, Value>, patch: &Map<String, Value>) -> Result<()> {
    match patch.get(DIRECTIVE).and_then(Value::as_str) {
        Some("replace") => {
            *target = without_directives(patch);
            return Ok(());
        }
        Some("delete") => {
            target.clear();
            return Ok(());
        }
        Some(other) if other != "merge" => {
            return Err(Error::Malformed(format!("unknown $patch directive: {other}")));
        }
        _ => {}
    }
    for (k, pv) in patch {
        if k == DIRECTIVE || k.starts_with("$setElementOrder/") || k.starts_with("$retainKeys") {
            continue;
        }
        match pv {
            Value::Null => {
                target.remove(k);
            }
            Value::Object(pm) => {
                let entry = target.entry(k.clone()).or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(tm) = entry {
                    merge_map(tm, pm)?;
                }
            }
            Value::Array(pa) => {
                let merged = match target.get(k) {
                    Some(Value::Array(ta)) if keyed(ta) && keyed(pa) => merge_list(ta, pa)?,
                    _ => pa.iter().filter(|v| !is_delete(v)).map(strip_directives).collect(),
                };
                target.insert(k.clone(), Value::Array(merged));
            }
            scalar => {
                target.insert(k.clone(), scalar.clone());
            }
        }
    }
    Ok(())
}

fn keyed(list: &[Value]) -> bool {
    !list.is_empty() && list.iter().all(|v| v.get(MERGE_KEY).map_or(false, Value::is_string))
}

fn is_delete(v: &Value) -> bool {
    v.get(DIRECTIVE).and_then(Value::as_str) == Some("delete")
}

fn merge_list(target: &[Value], patch: &[Value]) -> Result<Vec<Value>> {
    let mut out: Vec<Value> = target.to_vec();
    for pv in patch {
        let key = pv.get(MERGE_KEY).cloned();
        let pos = out.iter().position(|tv| tv.get(MERGE_KEY) == key.as_ref());
        match (pos, is_delete(pv)) {
            (Some(i), true) => {
                out.remove(i);
            }
            (None, true) => {}
            (Some(i), false) => {
                if let (Value::Object(tm), Value::Object(pm)) = (&mut out[i], pv) {
                    merge_map(tm, pm)?;
                }
            }
            (None, false) => out.push(strip_directives(pv)),
        }
    }
    Ok(out)
}

fn without_directives(m: &Map<String, Value>) -> Map<String, Value> {
    m.iter()
        .filter(|(k, _)| !k.starts_with('$'))
        .map(|(k, v)| (k.clone(), strip_directives(v)))
        .collect()
}

fn strip_directives(v: &Value) -> Value {
    match v {
        Value::Object(m) => Value::Object(without_directives(m)),
        Value::Array(a) => Value::Array(a.iter().map(strip_directives).collect()),
        other => other.clone(),
    }
}
