//! Single-run object map with a logical clock and an append-only change log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use metrics::counter;
use rekon_core::object::{event_message, event_parts, object_ref_of, object_reference, revision_of};
use rekon_core::{kinds, ChangeType, Error, ObjectChange, ObjectRef, ObjectType, Result};
use tracing::debug;

/// Renders `(old, new, change type, object type)` into a default-locale description
/// and an optional localized one.
pub type DescriptionFormatter = Arc<
    dyn Fn(Option<&DynamicObject>, Option<&DynamicObject>, ChangeType, &ObjectType) -> (String, Option<String>)
        + Send
        + Sync,
>;

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectRef, DynamicObject>,
    changes: Vec<ObjectChange>,
}

/// Every successful `insert`/`update`/`delete` takes one clock tick and records one
/// change. Reads hand out clones, so callers never alias stored state.
pub struct ChangeCaptureStore {
    inner: Mutex<Inner>,
    clock: AtomicI64,
    formatter: Option<DescriptionFormatter>,
}

impl Default for ChangeCaptureStore {
    fn default() -> Self { Self::new(None) }
}

impl ChangeCaptureStore {
    pub fn new(formatter: Option<DescriptionFormatter>) -> Self {
        Self { inner: Mutex::new(Inner::default()), clock: AtomicI64::new(0), formatter }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clock(&self) -> i64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Bulk seed without recording changes; the clock advances to the highest
    /// revision seen.
    pub fn load<I: IntoIterator<Item = DynamicObject>>(&self, objects: I) -> Result<()> {
        let mut inner = self.lock();
        let mut count = 0usize;
        for obj in objects {
            let key = object_ref_of(&obj)?;
            self.clock.fetch_max(revision_of(&obj), Ordering::SeqCst);
            inner.objects.insert(key, strip_managed_fields(obj));
            count += 1;
        }
        debug!(count, clock = self.clock(), "store: loaded");
        Ok(())
    }

    pub fn insert(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        let mut stored = strip_managed_fields(obj.clone());
        let rev = self.tick();
        stored.metadata.resource_version = Some(rev.to_string());
        let change = self.change_for(&key, None, Some(&stored), ChangeType::Creation, rev)?;
        inner.objects.insert(key.clone(), stored.clone());
        inner.changes.push(change);
        counter!("store_changes_total", 1u64, "type" => "Creation");
        debug!(obj = %key, rev, "store: insert");
        Ok(stored)
    }

    /// Replace a stored object. Content identical to the predecessor (after
    /// normalization) is a no-op: no change, no tick.
    pub fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        let mut inner = self.lock();
        let old = inner.objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))?;
        let candidate = strip_managed_fields(obj.clone());
        if rekon_apply::normalize(&old)? == rekon_apply::normalize(&candidate)? {
            counter!("store_noop_writes_total", 1u64);
            return Ok(old);
        }
        let mut stored = candidate;
        let rev = self.tick();
        stored.metadata.resource_version = Some(rev.to_string());
        let change = self.change_for(&key, Some(&old), Some(&stored), ChangeType::Update, rev)?;
        inner.objects.insert(key.clone(), stored.clone());
        inner.changes.push(change);
        counter!("store_changes_total", 1u64, "type" => "Update");
        debug!(obj = %key, rev, "store: update");
        Ok(stored)
    }

    /// Remove an object. Absent objects are a no-op.
    pub fn delete(&self, key: &ObjectRef) -> Result<Option<DynamicObject>> {
        let mut inner = self.lock();
        let Some(old) = inner.objects.remove(key) else {
            return Ok(None);
        };
        let rev = self.tick();
        let change = self.change_for(key, Some(&old), None, ChangeType::Deletion, rev)?;
        inner.changes.push(change);
        counter!("store_changes_total", 1u64, "type" => "Deletion");
        debug!(obj = %key, rev, "store: delete");
        Ok(Some(old))
    }

    pub fn get(&self, key: &ObjectRef) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn list(&self, ty: &ObjectType) -> Vec<DynamicObject> {
        self.lock()
            .objects
            .iter()
            .filter(|(k, _)| &k.object_type == ty)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn get_all(&self) -> BTreeMap<ObjectRef, DynamicObject> {
        self.lock().objects.clone()
    }

    /// The change log ordered by revision; equal revisions keep insertion order.
    pub fn changes(&self) -> Vec<ObjectChange> {
        let mut changes = self.lock().changes.clone();
        changes.sort_by_key(|c| c.revision);
        changes
    }

    pub fn change_count(&self) -> usize {
        self.lock().changes.len()
    }

    fn change_for(
        &self,
        key: &ObjectRef,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
        change_type: ChangeType,
        revision: i64,
    ) -> Result<ObjectChange> {
        let current = new.or(old).ok_or_else(|| Error::Internal(format!("change for {key} without object")))?;
        let is_event = key.object_type == kinds::event();
        let (change_type, object_reference, event_attributes) = if is_event && change_type != ChangeType::Deletion {
            let (reference, attrs) = event_parts(current)?;
            (ChangeType::Event, reference, Some(attrs))
        } else {
            let mut reference = object_reference(current)?;
            reference.resource_version = Some(revision.to_string());
            (change_type, reference, None)
        };
        let (description, local_description) = match &self.formatter {
            Some(f) => f(old, new, change_type, &key.object_type),
            None if change_type == ChangeType::Event => (event_message(current).to_string(), None),
            None => (change_type.as_str().to_string(), None),
        };
        Ok(ObjectChange {
            object_reference,
            change_type,
            event_attributes,
            revision,
            timestamp: Some(Time(chrono::Utc::now())),
            description,
            local_description,
        })
    }
}

fn strip_managed_fields(mut obj: DynamicObject) -> DynamicObject {
    obj.metadata.managed_fields = None;
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::object::new_object;
    use serde_json::json;

    fn cm(name: &str, v: &str) -> DynamicObject {
        let mut o = new_object(&kinds::config_map(), "ns", name);
        o.data = json!({"data": {"k": v}});
        o
    }

    #[test]
    fn load_advances_clock_without_changes() {
        let s = ChangeCaptureStore::default();
        let mut a = cm("a", "1");
        a.metadata.resource_version = Some("41".into());
        s.load([a, cm("b", "1")]).unwrap();
        assert_eq!(s.clock(), 41);
        assert_eq!(s.change_count(), 0);
        let created = s.insert(&cm("c", "1")).unwrap();
        assert_eq!(created.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn revisions_strictly_increase_across_writes() {
        let s = ChangeCaptureStore::default();
        s.insert(&cm("a", "1")).unwrap();
        s.insert(&cm("b", "1")).unwrap();
        s.update(&cm("a", "2")).unwrap();
        s.delete(&object_ref_of(&cm("b", "")).unwrap()).unwrap();
        let revs: Vec<i64> = s.changes().iter().map(|c| c.revision).collect();
        assert_eq!(revs, vec![1, 2, 3, 4]);
        let types: Vec<ChangeType> = s.changes().iter().map(|c| c.change_type).collect();
        assert_eq!(types, vec![ChangeType::Creation, ChangeType::Creation, ChangeType::Update, ChangeType::Deletion]);
    }

    #[test]
    fn identical_update_is_silent() {
        let s = ChangeCaptureStore::default();
        let stored = s.insert(&cm("a", "1")).unwrap();
        let mut same = cm("a", "1");
        same.metadata.resource_version = Some("999".into());
        let out = s.update(&same).unwrap();
        assert_eq!(out, stored);
        assert_eq!(s.clock(), 1);
        assert_eq!(s.change_count(), 1);
    }

    #[test]
    fn missing_objects_are_classified() {
        let s = ChangeCaptureStore::default();
        assert!(s.update(&cm("x", "1")).unwrap_err().is_not_found());
        assert_eq!(s.delete(&object_ref_of(&cm("x", "1")).unwrap()).unwrap(), None);
        assert_eq!(s.clock(), 0);
        s.insert(&cm("x", "1")).unwrap();
        assert!(s.insert(&cm("x", "2")).unwrap_err().is_already_exists());
    }

    #[test]
    fn reads_are_copies() {
        let s = ChangeCaptureStore::default();
        s.insert(&cm("a", "1")).unwrap();
        let mut all = s.get_all();
        for o in all.values_mut() {
            o.data["data"]["k"] = json!("mutated");
        }
        let key = object_ref_of(&cm("a", "1")).unwrap();
        assert_eq!(s.get(&key).unwrap().data["data"]["k"], json!("1"));
        assert_eq!(s.list(&kinds::config_map()).len(), 1);
        assert!(s.list(&kinds::secret()).is_empty());
    }

    #[test]
    fn events_reference_their_involved_object() {
        let s = ChangeCaptureStore::default();
        let mut ev = new_object(&kinds::event(), "ns", "pod-a.1");
        ev.data = json!({
            "involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "ns", "name": "pod-a"},
            "type": "Normal",
            "reason": "Started",
            "message": "Started container db"
        });
        s.insert(&ev).unwrap();
        let c = &s.changes()[0];
        assert_eq!(c.change_type, ChangeType::Event);
        assert_eq!(c.object_reference.kind.as_deref(), Some("Pod"));
        assert_eq!(c.description, "Started container db");
        let attrs = c.event_attributes.as_ref().unwrap();
        assert_eq!((attrs.name.as_str(), attrs.type_.as_str(), attrs.reason.as_str()), ("pod-a.1", "Normal", "Started"));
    }

    #[test]
    fn formatter_supplies_descriptions() {
        let f: DescriptionFormatter =
            Arc::new(|_: Option<&DynamicObject>, _: Option<&DynamicObject>, ct: ChangeType, ty: &ObjectType| {
                (format!("{}/{}", ty.kind, ct), Some("local".into()))
            });
        let s = ChangeCaptureStore::new(Some(f));
        s.insert(&cm("a", "1")).unwrap();
        let c = &s.changes()[0];
        assert_eq!(c.description, "ConfigMap/Creation");
        assert_eq!(c.local_description.as_deref(), Some("local"));
    }
}
