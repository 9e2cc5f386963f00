use std::collections::BTreeSet;
use std::sync::Arc;

use rekon_core::object::{new_object, object_ref_of, section_mut};
use rekon_core::{kinds, ChangeType, ObjectPatch};
use rekon_kubehub::{ListOptions, ObjectClient};
use rekon_mock::{EventRecorder, MockClient, OfflineClient};
use rekon_store::ChangeCaptureStore;
use serde_json::json;

fn mock() -> MockClient {
    let managed: BTreeSet<_> = [kinds::cluster(), kinds::component(), kinds::pod(), kinds::event()].into();
    MockClient::new(Arc::new(ChangeCaptureStore::default()), Arc::new(OfflineClient), managed)
}

fn component(replicas: i64) -> kube::core::DynamicObject {
    let mut c = new_object(&kinds::component(), "ns", "mycluster-mysql");
    c.data = json!({"spec": {"replicas": replicas}});
    c
}

#[tokio::test]
async fn create_noop_update_and_two_phase_delete() {
    let client = mock();
    let mut cluster = new_object(&kinds::cluster(), "ns", "mycluster");
    cluster.metadata.resource_version = Some("3".into());
    client.store().load([cluster.clone()]).unwrap();

    let created = client.create(&component(1)).await.unwrap();
    assert_eq!(created.metadata.generation, Some(1));
    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.creation_timestamp.is_some());

    client.update(&created).await.unwrap();
    let key = object_ref_of(&created).unwrap();
    client.delete(&key).await.unwrap();
    assert!(client.store().get(&key).unwrap().metadata.deletion_timestamp.is_some());
    client.delete(&key).await.unwrap();
    assert!(client.store().get(&key).is_none());

    let kinds: Vec<_> = client.store().changes().iter().map(|c| c.change_type).collect();
    assert_eq!(kinds, vec![ChangeType::Creation, ChangeType::Update, ChangeType::Deletion]);
    assert!(client.store().changes().iter().all(|c| c.object_reference.kind.as_deref() == Some("Component")));
    let revs: Vec<_> = client.store().changes().iter().map(|c| c.revision).collect();
    assert_eq!(revs, vec![4, 5, 6]);
    let cluster_key = object_ref_of(&cluster).unwrap();
    assert_eq!(client.store().get(&cluster_key).unwrap().metadata.resource_version.as_deref(), Some("3"));
}

#[tokio::test]
async fn create_existing_is_already_exists() {
    let client = mock();
    client.create(&component(1)).await.unwrap();
    let err = client.create(&component(2)).await.unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(client.store().change_count(), 1);
}

#[tokio::test]
async fn spec_change_bumps_generation_and_keeps_status() {
    let client = mock();
    let created = client.create(&component(1)).await.unwrap();
    let key = object_ref_of(&created).unwrap();

    let mut with_status = created.clone();
    section_mut(&mut with_status, "status")["phase"] = json!("Running");
    client.update_status(&with_status).await.unwrap();

    let mut next = component(3);
    section_mut(&mut next, "status")["phase"] = json!("Ignored");
    let updated = client.update(&next).await.unwrap();
    assert_eq!(updated.metadata.generation, Some(2));
    assert_eq!(updated.data["spec"]["replicas"], json!(3));
    assert_eq!(updated.data["status"]["phase"], json!("Running"));
    assert_eq!(updated.metadata.uid, created.metadata.uid);

    let stored = client.store().get(&key).unwrap();
    assert_eq!(stored.metadata.generation, Some(2));
}

#[tokio::test]
async fn status_writes_leave_spec_and_generation() {
    let client = mock();
    let created = client.create(&component(1)).await.unwrap();
    let key = object_ref_of(&created).unwrap();

    let mut next = created.clone();
    next.data["spec"]["replicas"] = json!(9);
    section_mut(&mut next, "status")["readyReplicas"] = json!(1);
    let stored = client.update_status(&next).await.unwrap();
    assert_eq!(stored.data["spec"]["replicas"], json!(1));
    assert_eq!(stored.data["status"]["readyReplicas"], json!(1));
    assert_eq!(stored.metadata.generation, Some(1));

    let before = client.store().change_count();
    client.update_status(&next).await.unwrap();
    assert_eq!(client.store().change_count(), before);

    let patch = ObjectPatch::Merge(json!({"status": {"phase": "Running"}, "spec": {"replicas": 5}}));
    let patched = client.patch_status(&key, &patch).await.unwrap();
    assert_eq!(patched.data["status"]["phase"], json!("Running"));
    assert_eq!(patched.data["spec"]["replicas"], json!(1));
}

#[tokio::test]
async fn merge_patch_on_main_resource() {
    let client = mock();
    let created = client.create(&component(1)).await.unwrap();
    let key = object_ref_of(&created).unwrap();
    let patch = ObjectPatch::Merge(json!({"metadata": {"labels": {"app": "db"}}}));
    let patched = client.patch(&key, &patch).await.unwrap();
    assert_eq!(patched.metadata.labels.unwrap().get("app").map(String::as_str), Some("db"));
    assert_eq!(patched.metadata.generation, Some(1));
    assert_eq!(client.store().change_count(), 2);
}

#[tokio::test]
async fn missing_objects_and_unmanaged_types() {
    let client = mock();
    let key = object_ref_of(&component(1)).unwrap();
    assert!(client.update(&component(1)).await.unwrap_err().is_not_found());
    assert!(client.get(&key).await.unwrap_err().is_not_found());
    client.delete(&key).await.unwrap();
    assert_eq!(client.store().change_count(), 0);

    let secret = new_object(&kinds::secret(), "ns", "s");
    assert!(client.create(&secret).await.is_err());
    assert!(client.list(&kinds::secret(), &ListOptions::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_filters_by_namespace_and_labels() {
    let client = mock();
    for (ns, name, app) in [("a", "p1", "db"), ("a", "p2", "web"), ("b", "p3", "db")] {
        let mut p = new_object(&kinds::pod(), ns, name);
        p.metadata.labels = Some([("app".to_string(), app.to_string())].into());
        client.create(&p).await.unwrap();
    }
    let opts = ListOptions::in_namespace("a").with_labels([("app".to_string(), "db".to_string())].into());
    let got = client.list(&kinds::pod(), &opts).await.unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].metadata.name.as_deref(), Some("p1"));
}

#[tokio::test]
async fn recorded_events_are_idempotent() {
    let client = mock();
    let created = client.create(&component(1)).await.unwrap();
    let recorder = EventRecorder::new("component-controller");
    for _ in 0..3 {
        recorder.record(&client, &created, "Normal", "Provisioning", "creating workloads").await.unwrap();
    }
    let changes = client.store().changes();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].change_type, ChangeType::Event);
    assert_eq!(changes[1].object_reference.name.as_deref(), Some("mycluster-mysql"));
    assert_eq!(changes[1].description, "creating workloads");
}
