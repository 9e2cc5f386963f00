//! Forward traversal (trees and flat maps, live or pinned to a revision) and
//! backward root finding.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use kube::core::DynamicObject;
use rekon_core::object::{object_ref_of, object_reference};
use rekon_core::{kinds, ObjectRef, ObjectTreeNode, Result};
use rekon_kubehub::{ListOptions, ObjectClient};
use rekon_store::ObjectRevisionStore;
use tracing::{debug, warn};

use crate::{QueryOptions, RuleSet};

/// Where secondaries of a primary come from.
#[async_trait::async_trait]
pub trait ObjectSource: Send + Sync {
    async fn secondaries(&self, rules: &RuleSet, primary: &DynamicObject) -> Result<Vec<DynamicObject>>;
}

/// Live reads through an object client.
pub struct Live<'a>(pub &'a dyn ObjectClient);

#[async_trait::async_trait]
impl ObjectSource for Live<'_> {
    async fn secondaries(&self, rules: &RuleSet, primary: &DynamicObject) -> Result<Vec<DynamicObject>> {
        let key = object_ref_of(primary)?;
        let mut out = Vec::new();
        for rule in rules.rules_for_primary(&key.object_type) {
            for owned in &rule.owned_resources {
                let opts = QueryOptions::parse(primary, &owned.criteria)?;
                if opts.unresolved {
                    continue;
                }
                let list_opts = opts.list_options(&owned.secondary, key.namespace());
                let found = self.0.list(&owned.secondary, &list_opts).await?;
                out.extend(found.into_iter().filter(|o| opts.matches(o)));
            }
        }
        Ok(out)
    }
}

/// Historical reads: for each name, the newest revision not after `revision`.
pub struct AtRevision<'a> {
    pub store: &'a ObjectRevisionStore,
    pub revision: i64,
}

#[async_trait::async_trait]
impl ObjectSource for AtRevision<'_> {
    async fn secondaries(&self, rules: &RuleSet, primary: &DynamicObject) -> Result<Vec<DynamicObject>> {
        let key = object_ref_of(primary)?;
        let mut out = Vec::new();
        for rule in rules.rules_for_primary(&key.object_type) {
            for owned in &rule.owned_resources {
                let opts = QueryOptions::parse(primary, &owned.criteria)?;
                let scope = opts.list_options(&owned.secondary, key.namespace());
                let candidates = self.store.list_at_revision(&owned.secondary, self.revision);
                out.extend(candidates.into_iter().filter(|o| scope.matches(o) && opts.matches(o)));
            }
        }
        Ok(out)
    }
}

/// Every object reachable from `root`, keyed by ref. Each object is expanded once.
pub async fn objects_from_source(
    source: &dyn ObjectSource,
    rules: &RuleSet,
    root: &DynamicObject,
) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
    let mut out = BTreeMap::new();
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(obj) = queue.pop_front() {
        let key = object_ref_of(&obj)?;
        if out.contains_key(&key) {
            continue;
        }
        for s in source.secondaries(rules, &obj).await? {
            queue.push_back(s);
        }
        out.insert(key, obj);
    }
    debug!(count = out.len(), "rules: collected objects");
    Ok(out)
}

pub async fn objects_from_cache(
    client: &dyn ObjectClient,
    rules: &RuleSet,
    root: &DynamicObject,
) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
    objects_from_source(&Live(client), rules, root).await
}

pub async fn objects_at_revision(
    store: &ObjectRevisionStore,
    rules: &RuleSet,
    root: &DynamicObject,
    revision: i64,
) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
    objects_from_source(&AtRevision { store, revision }, rules, root).await
}

struct Slot {
    node: ObjectTreeNode,
    key: ObjectRef,
    parent: Option<usize>,
    children: Vec<usize>,
}

fn has_ancestor(slots: &[Slot], mut at: Option<usize>, key: &ObjectRef) -> bool {
    while let Some(i) = at {
        if &slots[i].key == key {
            return true;
        }
        at = slots[i].parent;
    }
    false
}

/// Ownership tree rooted at `root`, secondaries sorted by kind, namespace, name and
/// apiVersion. An object may appear under several primaries but never below itself.
pub async fn object_tree(source: &dyn ObjectSource, rules: &RuleSet, root: &DynamicObject) -> Result<ObjectTreeNode> {
    let mut slots = vec![Slot {
        node: ObjectTreeNode::new(object_reference(root)?),
        key: object_ref_of(root)?,
        parent: None,
        children: Vec::new(),
    }];
    let mut queue = VecDeque::from([(0usize, root.clone())]);
    while let Some((idx, obj)) = queue.pop_front() {
        for s in source.secondaries(rules, &obj).await? {
            let key = object_ref_of(&s)?;
            if has_ancestor(&slots, Some(idx), &key) {
                debug!(obj = %key, "rules: ownership cycle skipped");
                continue;
            }
            let child = slots.len();
            slots.push(Slot { node: ObjectTreeNode::new(object_reference(&s)?), key, parent: Some(idx), children: Vec::new() });
            slots[idx].children.push(child);
            queue.push_back((child, s));
        }
    }
    // children always sit after their parent, so a reverse sweep sees finished subtrees
    let mut built: Vec<Option<ObjectTreeNode>> = Vec::with_capacity(slots.len());
    built.resize_with(slots.len(), || None);
    for i in (0..slots.len()).rev() {
        let mut node = std::mem::take(&mut slots[i].node);
        node.secondaries = slots[i].children.iter().filter_map(|c| built[*c].take()).collect();
        node.sort_secondaries();
        built[i] = Some(node);
    }
    Ok(built.swap_remove(0).unwrap_or_default())
}

pub async fn object_tree_from_cache(client: &dyn ObjectClient, rules: &RuleSet, root: &DynamicObject) -> Result<ObjectTreeNode> {
    object_tree(&Live(client), rules, root).await
}

pub async fn object_tree_at_revision(
    store: &ObjectRevisionStore,
    rules: &RuleSet,
    root: &DynamicObject,
    revision: i64,
) -> Result<ObjectTreeNode> {
    object_tree(&AtRevision { store, revision }, rules, root).await
}

/// Root-typed objects that (transitively) own `obj`. `obj` itself when it is of the
/// root type.
pub async fn find_roots(client: &dyn ObjectClient, rules: &RuleSet, obj: &DynamicObject) -> Result<Vec<DynamicObject>> {
    let mut roots = BTreeMap::new();
    let mut visited = BTreeSet::new();
    let mut queue = VecDeque::from([obj.clone()]);
    while let Some(cur) = queue.pop_front() {
        let key = object_ref_of(&cur)?;
        if !visited.insert(key.clone()) {
            continue;
        }
        if rules.is_root(&key.object_type) {
            roots.insert(key, cur);
            continue;
        }
        for (rule, owned) in rules.rules_for_secondary(&key.object_type) {
            let namespace = if kinds::is_cluster_scoped(&rule.primary) { None } else { key.namespace().map(str::to_string) };
            let opts = ListOptions { namespace, ..Default::default() };
            for primary in client.list(&rule.primary, &opts).await? {
                match QueryOptions::parse(&primary, &owned.criteria) {
                    Ok(q) if q.matches(&cur) => queue.push_back(primary),
                    Ok(_) => {}
                    Err(e) => warn!(
                        primary = ?primary.metadata.name,
                        kind = %rule.primary.kind,
                        error = %e,
                        "rules: skipping candidate owner"
                    ),
                }
            }
        }
    }
    Ok(roots.into_values().collect())
}
