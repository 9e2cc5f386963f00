//! Multi-revision object store with per-revision owner pins.
//!
//! A revision stays resident while at least one owner (identified by UID) pins it.
//! Exactly one physical copy is kept per `(type, name, revision)`; reads return
//! clones.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use kube::core::DynamicObject;
use metrics::counter;
use rekon_core::object::{object_ref_of, revision_of};
use rekon_core::{Error, ObjectRef, ObjectType, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    fn of(r: &ObjectRef) -> Self {
        Self { namespace: r.namespace.clone(), name: r.name.clone() }
    }
}

type Revisions = BTreeMap<i64, DynamicObject>;

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectType, BTreeMap<NamespacedName, Revisions>>,
    pins: FxHashMap<(ObjectRef, i64), FxHashSet<String>>,
}

#[derive(Default)]
pub struct ObjectRevisionStore {
    inner: RwLock<Inner>,
}

impl ObjectRevisionStore {
    pub fn new() -> Self { Self::default() }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `obj` at the revision parsed from its resourceVersion and pin it for `owner_uid`.
    pub fn insert(&self, obj: &DynamicObject, owner_uid: &str) -> Result<()> {
        let key = object_ref_of(obj)?;
        let rev = revision_of(obj);
        let mut inner = self.write();
        inner
            .objects
            .entry(key.object_type.clone())
            .or_default()
            .entry(NamespacedName::of(&key))
            .or_default()
            .entry(rev)
            .or_insert_with(|| obj.clone());
        inner.pins.entry((key.clone(), rev)).or_default().insert(owner_uid.to_string());
        debug!(obj = %key, rev, owner = owner_uid, "revision store: pinned");
        Ok(())
    }

    /// Exact-revision read; no fallback to a neighbouring revision.
    pub fn get(&self, key: &ObjectRef, revision: i64) -> Result<DynamicObject> {
        self.read()
            .objects
            .get(&key.object_type)
            .and_then(|names| names.get(&NamespacedName::of(key)))
            .and_then(|revs| revs.get(&revision))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{key} at revision {revision}")))
    }

    pub fn list(&self, ty: &ObjectType) -> BTreeMap<NamespacedName, Revisions> {
        self.read().objects.get(ty).cloned().unwrap_or_default()
    }

    /// For every name of `ty`, the highest stored revision not newer than `revision`.
    pub fn list_at_revision(&self, ty: &ObjectType, revision: i64) -> Vec<DynamicObject> {
        let inner = self.read();
        let Some(names) = inner.objects.get(ty) else {
            return Vec::new();
        };
        names
            .values()
            .filter_map(|revs| revs.range(..=revision).next_back().map(|(_, o)| o.clone()))
            .collect()
    }

    pub fn revisions(&self, key: &ObjectRef) -> Vec<i64> {
        self.read()
            .objects
            .get(&key.object_type)
            .and_then(|names| names.get(&NamespacedName::of(key)))
            .map(|revs| revs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drop `owner_uid`'s pin. The revision is evicted once no owner pins it; empty
    /// name and type levels are removed with it. Unknown pins are ignored.
    pub fn delete(&self, key: &ObjectRef, owner_uid: &str, revision: i64) {
        let mut inner = self.write();
        let pin_key = (key.clone(), revision);
        let Some(owners) = inner.pins.get_mut(&pin_key) else {
            warn!(obj = %key, revision, owner = owner_uid, "revision store: delete without pin");
            return;
        };
        if !owners.remove(owner_uid) {
            warn!(obj = %key, revision, owner = owner_uid, "revision store: owner held no pin");
            return;
        }
        if !owners.is_empty() {
            return;
        }
        inner.pins.remove(&pin_key);
        let nn = NamespacedName::of(key);
        let mut type_empty = false;
        if let Some(names) = inner.objects.get_mut(&key.object_type) {
            if let Some(revs) = names.get_mut(&nn) {
                revs.remove(&revision);
                if revs.is_empty() {
                    names.remove(&nn);
                }
            }
            type_empty = names.is_empty();
        }
        if type_empty {
            inner.objects.remove(&key.object_type);
        }
        counter!("revision_store_evictions_total", 1u64);
        debug!(obj = %key, revision, "revision store: evicted");
    }

    /// Number of resident `(object, revision)` entries.
    pub fn len(&self) -> usize {
        self.read().objects.values().flat_map(|names| names.values()).map(|revs| revs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }
}
