use std::sync::Arc;

use kube::core::DynamicObject;
use rekon_core::object::{new_object, object_ref_of, owner_reference};
use rekon_core::{kinds, Error, ObjectRef, ObjectType, Result};
use rekon_kubehub::{ListOptions, ObjectClient};
use rekon_mock::{MockClient, OfflineClient};
use rekon_rules::RuleSet;
use rekon_sim::{ReconcilerTree, Simulator};
use rekon_store::ChangeCaptureStore;
use serde_json::json;

fn setup() -> (MockClient, ReconcilerTree) {
    let managed = RuleSet::kubeblocks().managed_types();
    let client = MockClient::new(Arc::new(ChangeCaptureStore::default()), Arc::new(OfflineClient), managed.clone());
    (client, ReconcilerTree::kubeblocks(managed))
}

/// Rounds until a round records no change; panics past `max`.
async fn converge(tree: &ReconcilerTree, client: &MockClient, max: usize) -> usize {
    let mut last = client.store().change_count();
    for round in 1..=max {
        tree.run(client).await.unwrap();
        let now = client.store().change_count();
        if now == last {
            return round;
        }
        last = now;
    }
    panic!("no fixed point within {max} rounds");
}

async fn get(client: &MockClient, ty: ObjectType, ns: &str, name: &str) -> Option<DynamicObject> {
    client.get(&ObjectRef::new(ty, ns, name)).await.ok()
}

#[tokio::test]
async fn statefulset_brings_up_ready_pod() {
    let (client, tree) = setup();
    let mut sts = new_object(&kinds::stateful_set(), "ns", "db");
    sts.data = json!({"spec": {
        "replicas": 1,
        "selector": {"matchLabels": {"app": "db"}},
        "template": {"metadata": {"labels": {"app": "db"}}, "spec": {"containers": [{"name": "db"}]}},
    }});
    client.create(&sts).await.unwrap();

    let rounds = converge(&tree, &client, 10).await;
    assert!(rounds <= 10);
    let sts = get(&client, kinds::stateful_set(), "ns", "db").await.unwrap();
    assert_eq!(sts.data["status"]["readyReplicas"], sts.data["spec"]["replicas"]);
    let pod = get(&client, kinds::pod(), "ns", "db-0").await.unwrap();
    assert_eq!(pod.data["status"]["phase"], json!("Running"));
    assert_eq!(pod.metadata.labels.unwrap().get("app").map(String::as_str), Some("db"));
}

#[tokio::test]
async fn job_runs_its_pod_to_completion() {
    let (client, tree) = setup();
    let job = new_object(&kinds::job(), "ns", "backup-job");
    client.create(&job).await.unwrap();
    converge(&tree, &client, 10).await;

    let pod = get(&client, kinds::pod(), "ns", "backup-job-0").await.unwrap();
    assert_eq!(pod.data["status"]["phase"], json!("Succeeded"));
    let job = get(&client, kinds::job(), "ns", "backup-job").await.unwrap();
    assert_eq!(job.data["status"]["succeeded"], json!(1));
    assert_eq!(job.data["status"]["active"], json!(0));
}

#[tokio::test]
async fn claim_binds_to_synthesized_volume() {
    let (client, tree) = setup();
    let mut pvc = new_object(&kinds::pvc(), "ns", "data");
    pvc.data = json!({"spec": {"resources": {"requests": {"storage": "1Gi"}}}});
    client.create(&pvc).await.unwrap();
    converge(&tree, &client, 10).await;

    let pvc = get(&client, kinds::pvc(), "ns", "data").await.unwrap();
    assert_eq!(pvc.data["status"]["phase"], json!("Bound"));
    assert_eq!(pvc.data["spec"]["volumeName"], json!("data-pv"));
    let pv = get(&client, kinds::pv(), "", "data-pv").await.unwrap();
    assert_eq!(pv.data["spec"]["claimRef"]["name"], json!("data"));
    assert_eq!(pv.data["spec"]["capacity"]["storage"], json!("1Gi"));
    assert_eq!(pv.data["status"]["phase"], json!("Bound"));
}

#[tokio::test]
async fn volume_snapshot_becomes_ready() {
    let (client, tree) = setup();
    client.create(&new_object(&kinds::volume_snapshot(), "ns", "snap")).await.unwrap();
    converge(&tree, &client, 10).await;
    let snap = get(&client, kinds::volume_snapshot(), "ns", "snap").await.unwrap();
    assert_eq!(snap.data["status"]["readyToUse"], json!(true));
}

fn cluster(replicas: i64) -> DynamicObject {
    let mut c = new_object(&kinds::cluster(), "ns", "mycluster");
    c.data = json!({"spec": {"componentSpecs": [{
        "name": "mysql",
        "replicas": replicas,
        "volumeClaimTemplates": [{"name": "data", "spec": {"resources": {"requests": {"storage": "1Gi"}}}}],
    }]}});
    c
}

#[tokio::test]
async fn cluster_converges_to_running() {
    let (client, tree) = setup();
    client.create(&cluster(2)).await.unwrap();
    let rounds = converge(&tree, &client, 10).await;
    assert!(rounds <= 10);

    let c = get(&client, kinds::cluster(), "ns", "mycluster").await.unwrap();
    assert_eq!(c.data["status"]["phase"], json!("Running"));
    assert_eq!(c.data["status"]["components"]["mysql"]["phase"], json!("Running"));
    assert!(c.metadata.finalizers.unwrap().contains(&kinds::FINALIZER.to_string()));

    let comp = get(&client, kinds::component(), "ns", "mycluster-mysql").await.unwrap();
    assert_eq!(comp.data["status"]["phase"], json!("Running"));
    let its = get(&client, kinds::instance_set(), "ns", "mycluster-mysql").await.unwrap();
    assert_eq!(its.data["status"]["readyReplicas"], json!(2));
    for i in 0..2 {
        assert!(get(&client, kinds::pod(), "ns", &format!("mycluster-mysql-{i}")).await.is_some());
        let pvc = get(&client, kinds::pvc(), "ns", &format!("data-mycluster-mysql-{i}")).await.unwrap();
        assert_eq!(pvc.data["status"]["phase"], json!("Bound"));
    }
    let events = client.list(&kinds::event(), &ListOptions::default()).await.unwrap();
    assert_eq!(events.len(), 2);

    // the converged state is a fixed point: another round writes nothing
    let before = client.store().change_count();
    tree.run(&client).await.unwrap();
    assert_eq!(client.store().change_count(), before);
}

#[tokio::test]
async fn scale_down_removes_surplus_pods() {
    let (client, tree) = setup();
    client.create(&cluster(3)).await.unwrap();
    converge(&tree, &client, 10).await;

    let key = object_ref_of(&cluster(1)).unwrap();
    let mut current = client.get(&key).await.unwrap();
    current.data["spec"]["componentSpecs"][0]["replicas"] = json!(1);
    client.update(&current).await.unwrap();
    converge(&tree, &client, 10).await;

    assert!(get(&client, kinds::pod(), "ns", "mycluster-mysql-0").await.is_some());
    assert!(get(&client, kinds::pod(), "ns", "mycluster-mysql-1").await.is_none());
    assert!(get(&client, kinds::pod(), "ns", "mycluster-mysql-2").await.is_none());
    let its = get(&client, kinds::instance_set(), "ns", "mycluster-mysql").await.unwrap();
    assert_eq!(its.data["status"]["readyReplicas"], json!(1));
    let c = get(&client, kinds::cluster(), "ns", "mycluster").await.unwrap();
    assert_eq!(c.data["status"]["phase"], json!("Running"));
}

#[tokio::test]
async fn cluster_deletion_cascades_through_finalizers() {
    let (client, tree) = setup();
    client.create(&cluster(1)).await.unwrap();
    converge(&tree, &client, 10).await;

    let key = object_ref_of(&cluster(1)).unwrap();
    client.delete(&key).await.unwrap();
    converge(&tree, &client, 15).await;

    assert!(get(&client, kinds::cluster(), "ns", "mycluster").await.is_none());
    assert!(get(&client, kinds::component(), "ns", "mycluster-mysql").await.is_none());
    assert!(get(&client, kinds::instance_set(), "ns", "mycluster-mysql").await.is_none());
    assert!(get(&client, kinds::pod(), "ns", "mycluster-mysql-0").await.is_none());
    assert!(get(&client, kinds::service(), "ns", "mycluster-mysql-headless").await.is_none());
    // claims outlive their workload
    assert!(get(&client, kinds::pvc(), "ns", "data-mycluster-mysql-0").await.is_some());
}

#[tokio::test]
async fn dependents_follow_an_owner_deleted_against_a_live_cluster() {
    let managed = RuleSet::kubeblocks().managed_types();
    let mut sts = new_object(&kinds::stateful_set(), "ns", "db");
    sts.metadata.uid = Some("uid-db".into());
    sts.data = json!({"spec": {"replicas": 0, "selector": {"matchLabels": {"app": "db"}}}});
    let mut dep = new_object(&kinds::config_map(), "ns", "dep");
    dep.metadata.uid = Some("uid-dep".into());
    dep.metadata.owner_references = Some(vec![owner_reference(&sts, true).unwrap()]);

    let live = MockClient::new(Arc::new(ChangeCaptureStore::default()), Arc::new(OfflineClient), managed.clone());
    live.store().load([sts.clone(), dep.clone()]).unwrap();
    let dry = MockClient::new(Arc::new(ChangeCaptureStore::default()), Arc::new(live), managed.clone());
    dry.store().load([sts.clone(), dep]).unwrap();
    let tree = ReconcilerTree::kubeblocks(managed);

    let owner = object_ref_of(&sts).unwrap();
    dry.delete(&owner).await.unwrap();
    converge(&tree, &dry, 10).await;

    assert!(dry.is_deleted(&owner));
    assert!(dry.get(&owner).await.unwrap_err().is_not_found());
    assert!(get(&dry, kinds::config_map(), "ns", "dep").await.is_none());
}

struct Broken;

#[async_trait::async_trait]
impl Simulator for Broken {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn object_type(&self) -> ObjectType {
        kinds::config_map()
    }

    async fn reconcile(&self, _: &dyn ObjectClient, _: &DynamicObject) -> Result<()> {
        Err(Error::Internal("boom".into()))
    }
}

#[tokio::test]
async fn simulator_error_aborts_the_round() {
    let (client, _) = setup();
    client.create(&new_object(&kinds::config_map(), "ns", "cm")).await.unwrap();
    client.create(&new_object(&kinds::volume_snapshot(), "ns", "snap")).await.unwrap();
    let mut tree = ReconcilerTree::new();
    tree.register(Box::new(Broken))
        .register(Box::new(rekon_sim::VolumeSnapshotSimulator::new(kinds::volume_snapshot())));
    let err = tree.run(&client).await.unwrap_err();
    assert!(matches!(err, Error::Reconcile(ref m) if m.contains("broken") && m.contains("boom")));
    let snap = get(&client, kinds::volume_snapshot(), "ns", "snap").await.unwrap();
    assert!(snap.data.get("status").is_none());
}
