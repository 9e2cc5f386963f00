//! Sources of the baseline object set a plan starts from.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::core::DynamicObject;
use rekon_core::object::object_ref_of;
use rekon_core::{ObjectRef, ObjectTreeNode, Result};
use rekon_kubehub::ObjectClient;
use rekon_rules::{objects_from_cache, objects_from_tree, RuleSet};
use rekon_store::ObjectRevisionStore;

#[async_trait::async_trait]
pub trait ObjectLoader: Send + Sync {
    async fn load(&self) -> Result<BTreeMap<ObjectRef, DynamicObject>>;
}

/// Everything the rule table reaches from `root`, read live.
pub struct LiveLoader {
    client: Arc<dyn ObjectClient>,
    rules: Arc<RuleSet>,
    root: DynamicObject,
}

impl LiveLoader {
    pub fn new(client: Arc<dyn ObjectClient>, rules: Arc<RuleSet>, root: DynamicObject) -> Self {
        Self { client, rules, root }
    }
}

#[async_trait::async_trait]
impl ObjectLoader for LiveLoader {
    async fn load(&self) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
        objects_from_cache(self.client.as_ref(), &self.rules, &self.root).await
    }
}

/// The objects of a recorded tree at the revisions it pins.
pub struct HistoricalLoader {
    store: Arc<ObjectRevisionStore>,
    tree: ObjectTreeNode,
}

impl HistoricalLoader {
    pub fn new(store: Arc<ObjectRevisionStore>, tree: ObjectTreeNode) -> Self {
        Self { store, tree }
    }
}

#[async_trait::async_trait]
impl ObjectLoader for HistoricalLoader {
    async fn load(&self) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
        objects_from_tree(&self.tree, &self.store)
    }
}

/// A fixed object set, e.g. parsed from files.
#[derive(Debug, Clone, Default)]
pub struct StaticLoader(BTreeMap<ObjectRef, DynamicObject>);

impl StaticLoader {
    pub fn from_objects<I: IntoIterator<Item = DynamicObject>>(objects: I) -> Result<Self> {
        let mut map = BTreeMap::new();
        for o in objects {
            map.insert(object_ref_of(&o)?, o);
        }
        Ok(Self(map))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectLoader for StaticLoader {
    async fn load(&self) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
        Ok(self.0.clone())
    }
}
