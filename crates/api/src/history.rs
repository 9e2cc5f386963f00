//! Per-trace record of the live object tree: every observed revision is pinned in
//! the revision store under the trace's uid until the trace goes away.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use kube::core::DynamicObject;
use kube::ResourceExt;
use rekon_core::object::revision_of;
use rekon_core::{ChangeType, ObjectRef, ObjectTreeNode, Plan, Result};
use rekon_kubehub::ObjectClient;
use rekon_rules::{
    build_changes, build_object_summaries, delete_unused_revisions, object_tree_from_cache, objects_from_cache, RuleSet,
};
use rekon_store::{DescriptionFormatter, ObjectRevisionStore};
use tracing::{debug, info};

use crate::trace::{target_key, trace_key};
use crate::{CurrentState, ReconciliationTrace};

struct Recorded {
    owner: String,
    baseline: BTreeMap<ObjectRef, DynamicObject>,
    latest: BTreeMap<ObjectRef, DynamicObject>,
    state: CurrentState,
}

#[derive(Default)]
pub struct TraceHistory {
    store: Arc<ObjectRevisionStore>,
    traces: RwLock<BTreeMap<ObjectRef, Recorded>>,
}

fn owner_of(trace: &ReconciliationTrace) -> String {
    trace.uid().unwrap_or_else(|| trace_key(trace).to_string())
}

impl TraceHistory {
    pub fn new(store: Arc<ObjectRevisionStore>) -> Self {
        Self { store, traces: RwLock::default() }
    }

    pub fn store(&self) -> &Arc<ObjectRevisionStore> {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.traces.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tree recorded by the last observation of `trace`.
    pub fn object_tree(&self, trace: &ObjectRef) -> Option<ObjectTreeNode> {
        let traces = self.traces.read().unwrap_or_else(|p| p.into_inner());
        traces.get(trace).and_then(|r| r.state.object_tree.clone())
    }

    /// Read the trace's target tree live, pin every object revision seen and fold
    /// the differences since the previous observation into the current state.
    /// The first observation is the baseline and records no changes.
    pub async fn observe(
        &self,
        client: &dyn ObjectClient,
        rules: &RuleSet,
        trace: &ReconciliationTrace,
        formatter: &DescriptionFormatter,
    ) -> Result<CurrentState> {
        let key = trace_key(trace);
        let target = target_key(trace, &rules.root);
        let (objects, tree) = match client.get(&target).await {
            Ok(root) => (objects_from_cache(client, rules, &root).await?, Some(object_tree_from_cache(client, rules, &root).await?)),
            Err(e) if e.is_not_found() => (BTreeMap::new(), None),
            Err(e) => return Err(e),
        };
        let owner = owner_of(trace);
        for obj in objects.values() {
            self.store.insert(obj, &owner)?;
        }

        let mut traces = self.traces.write().unwrap_or_else(|p| p.into_inner());
        let rec = traces.entry(key.clone()).or_insert_with(|| {
            info!(trace = %key, target = %target, objects = objects.len(), "history: baseline recorded");
            Recorded {
                owner: owner.clone(),
                baseline: objects.clone(),
                latest: objects.clone(),
                state: Plan::default(),
            }
        });
        let changes = build_changes(&rec.latest, &objects, formatter);
        if !changes.is_empty() {
            debug!(trace = %key, changes = changes.len(), "history: changes recorded");
        }
        rec.state.changes.extend(changes);
        rec.latest = objects;
        rec.state.object_tree = tree.or_else(|| rec.state.object_tree.take());
        rec.state.summary = build_object_summaries(&rec.baseline, &rec.latest);
        Ok(rec.state.clone())
    }

    /// Drop the trace's record and release every revision it pinned.
    pub fn forget(&self, trace: &ObjectRef) -> bool {
        let removed = self.traces.write().unwrap_or_else(|p| p.into_inner()).remove(trace);
        let Some(rec) = removed else {
            return false;
        };
        // Deletions point at revisions already pinned by the baseline or an update.
        let pinned: Vec<_> = rec.state.changes.into_iter().filter(|c| c.change_type != ChangeType::Deletion).collect();
        delete_unused_revisions(&self.store, &pinned, &rec.owner);
        for (key, obj) in &rec.baseline {
            self.store.delete(key, &rec.owner, revision_of(obj));
        }
        info!(trace = %trace, "history: released");
        true
    }
}
