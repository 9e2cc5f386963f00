//! Rekon mock: an `ObjectClient` that routes managed types to a change-capture store
//! and everything else to a real client.
//!
//! Writes behave like the API server as far as controllers can observe: creates set
//! `generation: 1`, spec changes bump `generation`, status writes touch only status,
//! deletes are two-phase and writes that change nothing are dropped. A managed object
//! deleted during the run stays gone: reads never fall back to the real cluster for it.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use metrics::counter;
use rekon_apply::{apply_patch, metadata_changed, spec_changed, status_changed};
use rekon_core::object::object_ref_of;
use rekon_core::{Error, ObjectPatch, ObjectRef, ObjectType, Result};
use rekon_kubehub::{ListOptions, ObjectClient};
use rekon_store::ChangeCaptureStore;
use tracing::debug;

mod offline;
mod recorder;

pub use offline::OfflineClient;
pub use recorder::{EventRecorder, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};

pub struct MockClient {
    store: Arc<ChangeCaptureStore>,
    real: Arc<dyn ObjectClient>,
    managed: BTreeSet<ObjectType>,
    tombstones: RwLock<BTreeSet<ObjectRef>>,
}

impl MockClient {
    pub fn new(store: Arc<ChangeCaptureStore>, real: Arc<dyn ObjectClient>, managed: BTreeSet<ObjectType>) -> Self {
        Self { store, real, managed, tombstones: RwLock::default() }
    }

    pub fn store(&self) -> &Arc<ChangeCaptureStore> {
        &self.store
    }

    pub fn is_managed(&self, ty: &ObjectType) -> bool {
        self.managed.contains(ty)
    }

    /// Whether `key` was deleted through this client and not created again since.
    pub fn is_deleted(&self, key: &ObjectRef) -> bool {
        self.tombstones.read().map(|t| t.contains(key)).unwrap_or(false)
    }

    fn set_tombstone(&self, key: &ObjectRef, deleted: bool) {
        if let Ok(mut t) = self.tombstones.write() {
            if deleted {
                t.insert(key.clone());
            } else {
                t.remove(key);
            }
        }
    }

    fn predecessor(&self, key: &ObjectRef) -> Result<DynamicObject> {
        self.store.get(key).ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Persist a main-resource write of `next` over `old`. Status and server-owned
    /// metadata come from `old`.
    fn write_main(&self, old: &DynamicObject, mut next: DynamicObject) -> Result<DynamicObject> {
        match old.data.get("status") {
            Some(s) => next.data["status"] = s.clone(),
            None => {
                if let Some(m) = next.data.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        carry_server_fields(old, &mut next);
        let spec = spec_changed(old, &next);
        if !spec && !metadata_changed(old, &next) {
            counter!("mock_noop_writes_total", 1u64);
            return Ok(old.clone());
        }
        if spec {
            next.metadata.generation = Some(old.metadata.generation.unwrap_or(0) + 1);
        }
        self.store.update(&next)
    }

    /// Persist a status write: status and controller metadata from `next`, all
    /// else (spec, generation) from `old`.
    fn write_status(&self, old: &DynamicObject, next: &DynamicObject) -> Result<DynamicObject> {
        if !status_changed(old, next) && !metadata_changed(old, next) {
            counter!("mock_noop_writes_total", 1u64);
            return Ok(old.clone());
        }
        let mut stored = old.clone();
        match next.data.get("status") {
            Some(s) => stored.data["status"] = s.clone(),
            None => {
                if let Some(m) = stored.data.as_object_mut() {
                    m.remove("status");
                }
            }
        }
        let (m, n) = (&mut stored.metadata, &next.metadata);
        m.labels = n.labels.clone();
        m.annotations = n.annotations.clone();
        m.finalizers = n.finalizers.clone();
        m.owner_references = n.owner_references.clone();
        self.store.update(&stored)
    }

    fn new_uid(&self, key: &ObjectRef) -> String {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in key.to_string().as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        let seq = (self.store.clock() + 1) as u64;
        uuid::Uuid::from_u128(((h as u128) << 64) | seq as u128).to_string()
    }
}

fn carry_server_fields(old: &DynamicObject, next: &mut DynamicObject) {
    next.metadata.uid = old.metadata.uid.clone();
    next.metadata.creation_timestamp = old.metadata.creation_timestamp.clone();
    next.metadata.generation = old.metadata.generation;
    next.metadata.resource_version = old.metadata.resource_version.clone();
    if next.metadata.deletion_timestamp.is_none() {
        next.metadata.deletion_timestamp = old.metadata.deletion_timestamp.clone();
    }
}

#[async_trait::async_trait]
impl ObjectClient for MockClient {
    async fn get(&self, key: &ObjectRef) -> Result<DynamicObject> {
        if self.is_managed(&key.object_type) {
            if let Some(o) = self.store.get(key) {
                return Ok(o);
            }
            if self.is_deleted(key) {
                return Err(Error::NotFound(key.to_string()));
            }
        }
        self.real.get(key).await
    }

    async fn list(&self, ty: &ObjectType, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        if !self.is_managed(ty) {
            return self.real.list(ty, opts).await;
        }
        Ok(self.store.list(ty).into_iter().filter(|o| opts.matches(o)).collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        if !self.is_managed(&key.object_type) {
            return self.real.create(obj).await;
        }
        let mut next = obj.clone();
        next.metadata.generation = Some(1);
        next.metadata.deletion_timestamp = None;
        if next.metadata.uid.as_deref().map_or(true, str::is_empty) {
            next.metadata.uid = Some(self.new_uid(&key));
        }
        if next.metadata.creation_timestamp.is_none() {
            next.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
        debug!(obj = %key, "mock: create");
        let created = self.store.insert(&next)?;
        self.set_tombstone(&key, false);
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        if !self.is_managed(&key.object_type) {
            return self.real.update(obj).await;
        }
        let old = self.predecessor(&key)?;
        self.write_main(&old, obj.clone())
    }

    async fn patch(&self, key: &ObjectRef, patch: &ObjectPatch) -> Result<DynamicObject> {
        if !self.is_managed(&key.object_type) {
            return self.real.patch(key, patch).await;
        }
        let old = self.predecessor(key)?;
        let next = apply_patch(&old, patch)?;
        self.write_main(&old, next)
    }

    async fn delete(&self, key: &ObjectRef) -> Result<()> {
        if !self.is_managed(&key.object_type) {
            return self.real.delete(key).await;
        }
        let Some(old) = self.store.get(key) else {
            return Ok(());
        };
        if old.metadata.deletion_timestamp.is_none() {
            let mut next = old.clone();
            next.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            debug!(obj = %key, "mock: delete requested");
            self.store.update(&next)?;
        } else {
            debug!(obj = %key, "mock: delete completed");
            self.store.delete(key)?;
            self.set_tombstone(key, true);
        }
        Ok(())
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = object_ref_of(obj)?;
        if !self.is_managed(&key.object_type) {
            return self.real.update_status(obj).await;
        }
        let old = self.predecessor(&key)?;
        self.write_status(&old, obj)
    }

    async fn patch_status(&self, key: &ObjectRef, patch: &ObjectPatch) -> Result<DynamicObject> {
        if !self.is_managed(&key.object_type) {
            return self.real.patch_status(key, patch).await;
        }
        let old = self.predecessor(key)?;
        let next = apply_patch(&old, patch)?;
        self.write_status(&old, &next)
    }
}
