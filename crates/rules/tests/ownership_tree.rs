use std::sync::Arc;

use kube::core::DynamicObject;
use rekon_core::object::{new_object, object_ref_of, owner_reference};
use rekon_core::{kinds, ObjectType};
use rekon_mock::{MockClient, OfflineClient};
use rekon_rules::{find_roots, object_tree_at_revision, object_tree_from_cache, objects_from_cache, RuleSet};
use rekon_store::{ChangeCaptureStore, ObjectRevisionStore};

fn obj(ty: ObjectType, name: &str, uid: &str, labels: &[(&str, &str)], owner: Option<&DynamicObject>) -> DynamicObject {
    let mut o = new_object(&ty, "ns", name);
    o.metadata.uid = Some(uid.to_string());
    o.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    if let Some(owner) = owner {
        o.metadata.owner_references = Some(vec![owner_reference(owner, true).unwrap()]);
    }
    o
}

/// Cluster -> Component -> InstanceSet -> two Pods, plus a stray Pod of another set.
fn fixture() -> Vec<DynamicObject> {
    let app = [(kinds::LABEL_INSTANCE, "mycluster"), (kinds::LABEL_MANAGED_BY, kinds::MANAGED_BY_APP)];
    let cluster = obj(kinds::cluster(), "mycluster", "u-cluster", &[], None);
    let comp = obj(kinds::component(), "mycluster-mysql", "u-comp", &app, Some(&cluster));
    let its = obj(kinds::instance_set(), "mycluster-mysql", "u-its", &app, Some(&comp));
    let pod_labels = [(kinds::LABEL_WORKLOAD_MANAGED_BY, "InstanceSet"), (kinds::LABEL_WORKLOAD_INSTANCE, "mycluster-mysql")];
    let pod1 = obj(kinds::pod(), "mycluster-mysql-1", "u-p1", &pod_labels, Some(&its));
    let pod0 = obj(kinds::pod(), "mycluster-mysql-0", "u-p0", &pod_labels, Some(&its));
    let stray_labels = [(kinds::LABEL_WORKLOAD_MANAGED_BY, "InstanceSet"), (kinds::LABEL_WORKLOAD_INSTANCE, "other")];
    let stray = obj(kinds::pod(), "other-0", "u-x", &stray_labels, None);
    vec![cluster, comp, its, pod1, pod0, stray]
}

fn client(objects: Vec<DynamicObject>, rules: &RuleSet) -> MockClient {
    let store = Arc::new(ChangeCaptureStore::default());
    store.load(objects).unwrap();
    MockClient::new(store, Arc::new(OfflineClient), rules.managed_types())
}

#[tokio::test]
async fn tree_follows_ownership_and_sorts_secondaries() {
    let rules = RuleSet::kubeblocks();
    let objects = fixture();
    let client = client(objects.clone(), &rules);

    let tree = object_tree_from_cache(&client, &rules, &objects[0]).await.unwrap();
    assert_eq!(tree.primary.name.as_deref(), Some("mycluster"));
    assert_eq!(tree.node_count(), 5);
    let its = &tree.secondaries[0].secondaries[0];
    assert_eq!(its.primary.kind.as_deref(), Some("InstanceSet"));
    let pods: Vec<_> = its.secondaries.iter().map(|n| n.primary.name.clone().unwrap()).collect();
    assert_eq!(pods, vec!["mycluster-mysql-0", "mycluster-mysql-1"]);

    let again = object_tree_from_cache(&client, &rules, &objects[0]).await.unwrap();
    assert_eq!(tree, again);

    let flat = objects_from_cache(&client, &rules, &objects[0]).await.unwrap();
    assert_eq!(flat.len(), 5);
    assert!(!flat.keys().any(|k| k.name == "other-0"));
}

#[tokio::test]
async fn owner_validation_rejects_unowned_secondaries() {
    let rules = RuleSet::kubeblocks();
    let mut objects = fixture();
    objects[1].metadata.owner_references = None;
    let client = client(objects.clone(), &rules);
    let tree = object_tree_from_cache(&client, &rules, &objects[0]).await.unwrap();
    assert_eq!(tree.node_count(), 1);
}

#[tokio::test]
async fn roots_are_found_from_any_descendant() {
    let rules = RuleSet::kubeblocks();
    let objects = fixture();
    let client = client(objects.clone(), &rules);

    let roots = find_roots(&client, &rules, &objects[3]).await.unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].metadata.name.as_deref(), Some("mycluster"));

    assert!(find_roots(&client, &rules, &objects[5]).await.unwrap().is_empty());
    let itself = find_roots(&client, &rules, &objects[0]).await.unwrap();
    assert_eq!(object_ref_of(&itself[0]).unwrap(), object_ref_of(&objects[0]).unwrap());
}

#[tokio::test]
async fn owners_without_a_selector_are_skipped_when_finding_roots() {
    let rules = RuleSet::from_yaml(
        r#"
root: {apiVersion: apps/v1, kind: StatefulSet}
rules:
- primary: {apiVersion: apps/v1, kind: StatefulSet}
  ownedResources:
  - secondary: {apiVersion: v1, kind: Pod}
    criteria:
      selector: spec.selector.matchLabels
      validation: None
"#,
    )
    .unwrap();
    let mut good = obj(kinds::stateful_set(), "db", "u-db", &[], None);
    good.data = serde_json::json!({"spec": {"selector": {"matchLabels": {"app": "db"}}}});
    let bare = obj(kinds::stateful_set(), "bare", "u-bare", &[], None);
    let pod = obj(kinds::pod(), "db-0", "u-pod", &[("app", "db")], None);
    let client = client(vec![bare, good, pod.clone()], &rules);

    let roots = find_roots(&client, &rules, &pod).await.unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].metadata.name.as_deref(), Some("db"));
}

#[tokio::test]
async fn tree_at_revision_uses_versions_in_effect() {
    let rules = RuleSet::kubeblocks();
    let objects = fixture();
    let store = ObjectRevisionStore::new();
    let rev = |mut o: DynamicObject, r: i64| {
        o.metadata.resource_version = Some(r.to_string());
        o
    };
    store.insert(&rev(objects[0].clone(), 1), "trace").unwrap();
    store.insert(&rev(objects[1].clone(), 2), "trace").unwrap();
    store.insert(&rev(objects[2].clone(), 3), "trace").unwrap();
    store.insert(&rev(objects[4].clone(), 10), "trace").unwrap();
    store.insert(&rev(objects[3].clone(), 30), "trace").unwrap();

    let early = object_tree_at_revision(&store, &rules, &objects[0], 5).await.unwrap();
    assert_eq!(early.node_count(), 3);
    let mid = object_tree_at_revision(&store, &rules, &objects[0], 25).await.unwrap();
    assert_eq!(mid.node_count(), 4);
    let late = object_tree_at_revision(&store, &rules, &objects[0], 30).await.unwrap();
    assert_eq!(late.node_count(), 5);
}
