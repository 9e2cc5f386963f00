use kube::core::DynamicObject;
use rekon_core::object::{new_object, object_ref_of, revision_of};
use rekon_core::{kinds, ChangeType};
use rekon_store::{ChangeCaptureStore, ObjectRevisionStore};
use serde_json::json;

fn pod(name: &str, image: &str) -> DynamicObject {
    let mut p = new_object(&kinds::pod(), "ns", name);
    p.data = json!({"spec": {"containers": [{"name": "c", "image": image}]}});
    p
}

/// Every captured mutation pinned into the revision store reproduces the world as
/// of any change revision.
#[test]
fn captured_writes_replay_at_each_revision() {
    let capture = ChangeCaptureStore::default();
    let history = ObjectRevisionStore::new();
    let owner = "trace-uid";

    let a1 = capture.insert(&pod("a", "v1")).unwrap();
    history.insert(&a1, owner).unwrap();
    let b1 = capture.insert(&pod("b", "v1")).unwrap();
    history.insert(&b1, owner).unwrap();
    let mut a2 = a1.clone();
    a2.data["spec"]["containers"][0]["image"] = json!("v2");
    let a2 = capture.update(&a2).unwrap();
    history.insert(&a2, owner).unwrap();

    let changes = capture.changes();
    let kinds: Vec<_> = changes.iter().map(|c| c.change_type).collect();
    assert_eq!(kinds, vec![ChangeType::Creation, ChangeType::Creation, ChangeType::Update]);

    let image_at = |rev: i64| -> Vec<String> {
        let mut out: Vec<_> = history
            .list_at_revision(&kinds::pod(), rev)
            .iter()
            .map(|p| format!("{}={}", p.metadata.name.clone().unwrap_or_default(), p.data["spec"]["containers"][0]["image"].as_str().unwrap_or("")))
            .collect();
        out.sort();
        out
    };
    assert_eq!(image_at(changes[0].revision), vec!["a=v1"]);
    assert_eq!(image_at(changes[1].revision), vec!["a=v1", "b=v1"]);
    assert_eq!(image_at(changes[2].revision), vec!["a=v2", "b=v1"]);

    // Releasing the first pin evicts only that revision of `a`.
    let key = object_ref_of(&a1).unwrap();
    history.delete(&key, owner, revision_of(&a1));
    assert_eq!(history.revisions(&key), vec![revision_of(&a2)]);
    assert_eq!(history.len(), 2);
}

#[test]
fn unchanged_update_records_nothing() {
    let capture = ChangeCaptureStore::default();
    let stored = capture.insert(&pod("a", "v1")).unwrap();
    let again = capture.update(&stored).unwrap();
    assert_eq!(again.metadata.resource_version, stored.metadata.resource_version);
    assert_eq!(capture.change_count(), 1);
}
