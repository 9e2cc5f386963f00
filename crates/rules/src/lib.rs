//! Rekon rules: the declarative primary → secondary ownership graph and the
//! traversals built on it.
//!
//! A rule says that objects of the primary type own the objects of each secondary
//! type matching a criteria. Criteria are evaluated against a concrete primary into
//! [`QueryOptions`], which both drive list calls and filter candidates.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use kube::core::DynamicObject;
use once_cell::sync::OnceCell;
use rekon_core::{kinds, object::is_owned_by, Error, ObjectType, Result};
use rekon_kubehub::{ApiDiscovery, ListOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

mod changes;
mod defaults;
mod traverse;

pub use changes::{build_changes, build_object_summaries, delete_unused_revisions, objects_from_tree};
pub use traverse::{
    find_roots, object_tree, object_tree_at_revision, object_tree_from_cache, objects_at_revision,
    objects_from_cache, objects_from_source, AtRevision, Live, ObjectSource,
};

/// Dotted path into an object, e.g. `spec.volumeName` or `spec.selector.matchLabels`.
/// A segment may end in a single `[index]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(String);

impl FieldPath {
    pub fn parse(path: &str) -> Result<Self> {
        normalize_json_path(path)
            .map(FieldPath)
            .ok_or_else(|| Error::Malformed(format!("invalid field path: {path:?}")))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Resolve against an object's JSON form.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut cur = root;
        for seg in self.0.split('.') {
            let (key, index) = match seg.split_once('[') {
                Some((k, rest)) => (k, rest.trim_end_matches(']').parse::<usize>().ok()),
                None => (seg, None),
            };
            cur = cur.get(key)?;
            if let Some(i) = index {
                cur = cur.get(i)?;
            }
        }
        Some(cur)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> { FieldPath::parse(&s) }
}

impl From<FieldPath> for String {
    fn from(p: FieldPath) -> Self { p.0 }
}

fn normalize_json_path(jp: &str) -> Option<String> {
    if jp.contains('?') || jp.contains('*') { return None; }
    let s = jp.strip_prefix('.').unwrap_or(jp);
    if s.is_empty() { return None; }
    for seg in s.split('.') {
        if seg.is_empty() { return None; }
        let key = match seg.split_once('[') {
            Some((key, rest)) => {
                let digits = rest.strip_suffix(']')?;
                if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) { return None; }
                key
            }
            None => seg,
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return None;
        }
    }
    Some(s.to_string())
}

/// How a secondary's owner references must point back at the primary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Validation {
    /// An owner reference with the primary's UID and `controller: true`.
    Controller,
    /// Any owner reference with the primary's UID.
    Owner,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Matcher {
    /// The primary carries a label map (or a `matchLabels` selector) at this path.
    Selector(FieldPath),
    /// Fixed labels; values may use `$(primary)` (the primary's value for the same
    /// key) and `$(primary.name)`.
    Labels(BTreeMap<String, String>),
    /// The secondary's name is read from the primary at this path.
    SpecifiedName(FieldPath),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipCriteria {
    #[serde(flatten)]
    pub matcher: Matcher,
    #[serde(default)]
    pub validation: Validation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedResource {
    pub secondary: ObjectType,
    pub criteria: OwnershipCriteria,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipRule {
    pub primary: ObjectType,
    pub owned_resources: Vec<OwnedResource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOwner {
    pub uid: String,
    pub controller: bool,
}

/// Criteria evaluated against one primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub labels: Option<BTreeMap<String, String>>,
    pub name: Option<String>,
    pub owner: Option<MatchOwner>,
    /// A specified-name path that the primary does not set; nothing matches.
    pub unresolved: bool,
}

impl QueryOptions {
    pub fn parse(primary: &DynamicObject, criteria: &OwnershipCriteria) -> Result<Self> {
        let mut opts = QueryOptions::default();
        match &criteria.matcher {
            Matcher::Selector(path) => {
                let doc = serde_json::to_value(primary)?;
                let found = path
                    .resolve(&doc)
                    .ok_or_else(|| Error::Malformed(format!("selector field {} does not exist", path.as_str())))?;
                let map = found.get("matchLabels").unwrap_or(found);
                let labels: BTreeMap<String, String> = serde_json::from_value(map.clone())
                    .map_err(|e| Error::Malformed(format!("field {} is not a label selector: {e}", path.as_str())))?;
                opts.labels = Some(labels);
            }
            Matcher::Labels(template) => {
                let name = primary.metadata.name.as_deref().unwrap_or_default();
                let own = primary.metadata.labels.as_ref();
                let labels = template
                    .iter()
                    .map(|(k, v)| {
                        let same_key = own.and_then(|l| l.get(k)).map(String::as_str).unwrap_or_default();
                        let value = v.replace("$(primary.name)", name).replace("$(primary)", same_key);
                        (k.clone(), value)
                    })
                    .collect();
                opts.labels = Some(labels);
            }
            Matcher::SpecifiedName(path) => {
                let doc = serde_json::to_value(primary)?;
                match path.resolve(&doc) {
                    Some(Value::String(s)) if !s.is_empty() => opts.name = Some(s.clone()),
                    Some(Value::Number(n)) => opts.name = Some(n.to_string()),
                    _ => opts.unresolved = true,
                }
            }
        }
        if criteria.validation != Validation::None {
            opts.owner = Some(MatchOwner {
                uid: primary.metadata.uid.clone().unwrap_or_default(),
                controller: criteria.validation == Validation::Controller,
            });
        }
        Ok(opts)
    }

    pub fn matches(&self, obj: &DynamicObject) -> bool {
        if self.unresolved {
            return false;
        }
        if let Some(want) = &self.labels {
            let have = obj.metadata.labels.as_ref();
            if !want.iter().all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v)) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if obj.metadata.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if !is_owned_by(obj, &owner.uid, owner.controller) {
                return false;
            }
        }
        true
    }

    /// List options for candidates of `secondary` owned by a primary in `namespace`.
    pub fn list_options(&self, secondary: &ObjectType, namespace: Option<&str>) -> ListOptions {
        let namespace = if kinds::is_cluster_scoped(secondary) { None } else { namespace.map(str::to_string) };
        ListOptions { namespace, labels: self.labels.clone().unwrap_or_default() }
    }
}

/// An immutable rule table and the type that roots every tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub root: ObjectType,
    pub rules: Vec<OwnershipRule>,
}

impl RuleSet {
    pub fn new(root: ObjectType, rules: Vec<OwnershipRule>) -> Self {
        Self { root, rules }
    }

    /// Database-operator ownership graph rooted at `Cluster`.
    pub fn kubeblocks() -> Self {
        Self::new(kinds::cluster(), defaults::kubeblocks_rules())
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Malformed(format!("rule table: {e}")))
    }

    pub fn is_root(&self, ty: &ObjectType) -> bool {
        &self.root == ty
    }

    pub fn rules_for_primary<'a>(&'a self, ty: &'a ObjectType) -> impl Iterator<Item = &'a OwnershipRule> + 'a {
        self.rules.iter().filter(move |r| &r.primary == ty)
    }

    pub fn rules_for_secondary<'a>(&'a self, ty: &'a ObjectType) -> impl Iterator<Item = (&'a OwnershipRule, &'a OwnedResource)> + 'a {
        self.rules
            .iter()
            .flat_map(|r| r.owned_resources.iter().map(move |o| (r, o)))
            .filter(move |(_, o)| &o.secondary == ty)
    }

    /// Every primary and secondary type, the root and Event.
    pub fn managed_types(&self) -> BTreeSet<ObjectType> {
        let mut out: BTreeSet<ObjectType> = self
            .rules
            .iter()
            .flat_map(|r| std::iter::once(r.primary.clone()).chain(r.owned_resources.iter().map(|o| o.secondary.clone())))
            .collect();
        out.insert(self.root.clone());
        out.insert(kinds::event());
        out
    }

    /// Drop rules and owned resources naming types the cluster does not serve; a rule
    /// left without owned resources is dropped entirely.
    pub fn filter_unsupported(&self, discovery: &dyn ApiDiscovery) -> Self {
        let mut rules = Vec::new();
        for rule in &self.rules {
            if !discovery.serves(&rule.primary) {
                warn!(primary = %rule.primary, "rules: primary type not served; rule dropped");
                continue;
            }
            let owned: Vec<OwnedResource> = rule
                .owned_resources
                .iter()
                .filter(|o| {
                    let served = discovery.serves(&o.secondary);
                    if !served {
                        warn!(primary = %rule.primary, secondary = %o.secondary, "rules: secondary type not served");
                    }
                    served
                })
                .cloned()
                .collect();
            if !owned.is_empty() {
                rules.push(OwnershipRule { primary: rule.primary.clone(), owned_resources: owned });
            }
        }
        info!(kept = rules.len(), total = self.rules.len(), "rules: filtered against discovery");
        Self { root: self.root.clone(), rules }
    }
}

static RULES: OnceCell<RuleSet> = OnceCell::new();

/// Install the process-wide rule table. The first call wins; later calls return the
/// table already installed.
pub fn init_rules(rules: RuleSet) -> &'static RuleSet {
    RULES.get_or_init(|| rules)
}

/// The process-wide rule table, defaulting to the unfiltered database-operator graph.
pub fn rules() -> &'static RuleSet {
    RULES.get_or_init(RuleSet::kubeblocks)
}
