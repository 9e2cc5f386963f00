//! Summaries and change sets between two object maps, and revision bookkeeping for
//! recorded trees.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::DynamicObject;
use rekon_core::object::{event_parts, new_object, parse_revision};
use rekon_core::{
    kinds, ChangeType, ObjectChange, ObjectChangeSummary, ObjectRef, ObjectSummary, ObjectTreeNode, ObjectType, Result,
};
use rekon_store::{DescriptionFormatter, ObjectRevisionStore};
use tracing::warn;

fn bump(slot: &mut Option<i32>) {
    *slot = Some(slot.unwrap_or(0) + 1);
}

/// Per-type counts between two snapshots. `total` counts objects present in
/// `new`; an object present in both counts as updated only when its
/// resourceVersion moved. Sorted by apiVersion, then kind.
pub fn build_object_summaries(
    initial: &BTreeMap<ObjectRef, DynamicObject>,
    new: &BTreeMap<ObjectRef, DynamicObject>,
) -> Vec<ObjectSummary> {
    fn entry<'a>(by_type: &'a mut BTreeMap<ObjectType, ObjectSummary>, ty: &ObjectType) -> &'a mut ObjectSummary {
        by_type.entry(ty.clone()).or_insert_with(|| ObjectSummary {
            object_type: ty.clone(),
            total: 0,
            change_summary: Some(ObjectChangeSummary::default()),
        })
    }
    let mut by_type: BTreeMap<ObjectType, ObjectSummary> = BTreeMap::new();
    for (key, obj) in new {
        let s = entry(&mut by_type, &key.object_type);
        s.total += 1;
        let cs = s.change_summary.get_or_insert_with(Default::default);
        match initial.get(key) {
            None => bump(&mut cs.added),
            Some(old) if old.metadata.resource_version != obj.metadata.resource_version => bump(&mut cs.updated),
            Some(_) => {}
        }
    }
    for key in initial.keys().filter(|k| !new.contains_key(*k)) {
        let s = entry(&mut by_type, &key.object_type);
        bump(&mut s.change_summary.get_or_insert_with(Default::default).deleted);
    }
    by_type.into_values().collect()
}

/// Changes between two snapshots in Creation, Update, Deletion order (each group in
/// ref order). Updates with an unchanged resourceVersion are skipped; Events become
/// `Event` changes on their involved object and are never reported as deleted.
pub fn build_changes(
    old: &BTreeMap<ObjectRef, DynamicObject>,
    new: &BTreeMap<ObjectRef, DynamicObject>,
    formatter: &DescriptionFormatter,
) -> Vec<ObjectChange> {
    let created = new.iter().filter(|(k, _)| !old.contains_key(*k)).map(|(k, n)| (k, None, Some(n), ChangeType::Creation));
    let updated = new.iter().filter_map(|(k, n)| {
        let o = old.get(k)?;
        (o.metadata.resource_version != n.metadata.resource_version).then_some((k, Some(o), Some(n), ChangeType::Update))
    });
    let deleted = old.iter().filter(|(k, _)| !new.contains_key(*k)).map(|(k, o)| (k, Some(o), None, ChangeType::Deletion));

    let mut out = Vec::new();
    for (key, old_obj, new_obj, change_type) in created.chain(updated).chain(deleted) {
        let Some(obj) = new_obj.or(old_obj) else { continue };
        let is_event = key.object_type == kinds::event();
        if is_event && change_type == ChangeType::Deletion {
            continue;
        }
        let (change_type, object_reference, event_attributes) = if is_event {
            match event_parts(obj) {
                Ok((reference, attrs)) => (ChangeType::Event, reference, Some(attrs)),
                Err(e) => {
                    warn!(event = %key, error = %e, "changes: skipping malformed event");
                    continue;
                }
            }
        } else {
            (change_type, key.to_reference(obj.metadata.uid.clone(), obj.metadata.resource_version.clone()), None)
        };
        let (description, local_description) = formatter(old_obj, new_obj, change_type, &key.object_type);
        out.push(ObjectChange {
            object_reference,
            change_type,
            event_attributes,
            revision: parse_revision(obj.metadata.resource_version.as_deref()),
            timestamp: Some(Time(chrono::Utc::now())),
            description,
            local_description,
        });
    }
    out
}

/// Release `owner_uid`'s pin on every revision referenced by `changes`. Event changes
/// point at their involved object, so they release the Event itself.
pub fn delete_unused_revisions(store: &ObjectRevisionStore, changes: &[ObjectChange], owner_uid: &str) {
    for change in changes {
        let mut key = ObjectRef::from_reference(&change.object_reference);
        if change.change_type == ChangeType::Event {
            let Some(attrs) = &change.event_attributes else { continue };
            key.object_type = kinds::event();
            key.name = attrs.name.clone();
        }
        store.delete(&key, owner_uid, change.revision);
    }
}

/// Load every node of a recorded tree at its pinned revision. Nodes whose revision
/// is no longer stored are replaced by a stub carrying only identity, uid and
/// resourceVersion.
pub fn objects_from_tree(tree: &ObjectTreeNode, store: &ObjectRevisionStore) -> Result<BTreeMap<ObjectRef, DynamicObject>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![tree];
    while let Some(node) = stack.pop() {
        let key = ObjectRef::from_reference(&node.primary);
        let revision = parse_revision(node.primary.resource_version.as_deref());
        let obj = match store.get(&key, revision) {
            Ok(o) => o,
            Err(e) if e.is_not_found() => {
                warn!(obj = %key, revision, "tree: revision missing; using stub");
                let mut stub = new_object(&key.object_type, &key.namespace, &key.name);
                stub.metadata.resource_version = node.primary.resource_version.clone();
                stub.metadata.uid = node.primary.uid.clone();
                stub
            }
            Err(e) => return Err(e),
        };
        out.insert(key, obj);
        stack.extend(node.secondaries.iter());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rekon_core::object::{new_object, object_ref_of};
    use serde_json::json;
    use std::sync::Arc;

    fn at(ty: &ObjectType, name: &str, rv: &str) -> (ObjectRef, DynamicObject) {
        let mut o = new_object(ty, "ns", name);
        o.metadata.resource_version = Some(rv.to_string());
        (object_ref_of(&o).unwrap(), o)
    }

    fn plain() -> DescriptionFormatter {
        Arc::new(|_: Option<&DynamicObject>, _: Option<&DynamicObject>, ct: ChangeType, _: &ObjectType| (ct.to_string(), None))
    }

    #[test]
    fn summaries_count_added_updated_deleted() {
        let initial: BTreeMap<_, _> = [at(&kinds::pod(), "a", "1"), at(&kinds::pod(), "b", "1"), at(&kinds::pod(), "c", "1")].into();
        let new: BTreeMap<_, _> = [at(&kinds::pod(), "a", "1"), at(&kinds::pod(), "b", "5"), at(&kinds::pod(), "d", "6"), at(&kinds::job(), "j", "7")].into();
        let s = build_object_summaries(&initial, &new);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].object_type, kinds::job());
        let pods = &s[1];
        assert_eq!(pods.total, 3);
        let cs = pods.change_summary.clone().unwrap();
        assert_eq!((cs.added, cs.updated, cs.deleted), (Some(1), Some(1), Some(1)));
    }

    #[test]
    fn changes_are_grouped_and_events_resolved() {
        let mut ev = new_object(&kinds::event(), "ns", "a.1");
        ev.metadata.resource_version = Some("9".into());
        ev.data = json!({"involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "ns", "name": "a"}, "type": "Warning", "reason": "BackOff"});
        let old_ev = at(&kinds::event(), "gone.1", "2");
        let old: BTreeMap<_, _> = [at(&kinds::pod(), "a", "1"), at(&kinds::pod(), "b", "1"), at(&kinds::pod(), "z", "1"), old_ev].into();
        let new: BTreeMap<_, _> = [
            at(&kinds::pod(), "a", "3"),
            at(&kinds::pod(), "b", "1"),
            at(&kinds::pod(), "c", "4"),
            (object_ref_of(&ev).unwrap(), ev),
        ]
        .into();
        let changes = build_changes(&old, &new, &plain());
        let seen: Vec<_> = changes.iter().map(|c| (c.change_type, c.object_reference.name.clone().unwrap(), c.revision)).collect();
        assert_eq!(seen, vec![
            (ChangeType::Event, "a".to_string(), 9),
            (ChangeType::Creation, "c".to_string(), 4),
            (ChangeType::Update, "a".to_string(), 3),
            (ChangeType::Deletion, "z".to_string(), 1),
        ]);
        assert_eq!(changes[0].event_attributes.as_ref().unwrap().reason, "BackOff");
        assert_eq!(changes[0].description, "Event");
    }

    #[test]
    fn missing_tree_revisions_become_stubs() {
        let store = ObjectRevisionStore::new();
        let (_, pod) = at(&kinds::pod(), "a", "3");
        store.insert(&pod, "t").unwrap();
        let mut tree = ObjectTreeNode::new(object_ref_of(&pod).unwrap().to_reference(Some("u".into()), Some("3".into())));
        tree.secondaries.push(ObjectTreeNode::new(
            ObjectRef::new(kinds::pvc(), "ns", "data").to_reference(Some("u2".into()), Some("8".into())),
        ));
        let objs = objects_from_tree(&tree, &store).unwrap();
        assert_eq!(objs.len(), 2);
        let stub = &objs[&ObjectRef::new(kinds::pvc(), "ns", "data")];
        assert_eq!(stub.metadata.uid.as_deref(), Some("u2"));
        assert_eq!(stub.metadata.resource_version.as_deref(), Some("8"));
    }

    #[test]
    fn unused_revisions_release_event_pins() {
        let store = ObjectRevisionStore::new();
        let mut ev = new_object(&kinds::event(), "ns", "a.1");
        ev.metadata.resource_version = Some("4".into());
        ev.data = json!({"involvedObject": {"apiVersion": "v1", "kind": "Pod", "namespace": "ns", "name": "a"}});
        store.insert(&ev, "t").unwrap();
        let (_, pod) = at(&kinds::pod(), "a", "3");
        store.insert(&pod, "t").unwrap();
        let changes = build_changes(&BTreeMap::new(), &[(object_ref_of(&ev).unwrap(), ev), (object_ref_of(&pod).unwrap(), pod)].into(), &plain());
        delete_unused_revisions(&store, &changes, "t");
        assert!(store.is_empty());
    }
}
