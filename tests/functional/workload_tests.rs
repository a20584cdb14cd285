//! StatefulSet convergence, validation and per-replica-set isolation.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::runtime::controller::Action;

use mongodb_operator::controller::cluster_reconciler::{
    REQUEUE_FINALIZER, REQUEUE_INITIALIZING, reconcile,
};
use mongodb_operator::controller::context::FINALIZER;
use mongodb_operator::controller::error::Error;
use mongodb_operator::controller::status::get_condition_reason;
use mongodb_operator::controller::watchdog::PodCache;
use mongodb_operator::crd::ReplsetSpec;

use crate::mock_state::{MockWorld, NAMESPACE, test_cluster};

fn mongod_image(sts: &StatefulSet) -> String {
    sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .image
        .clone()
        .unwrap()
}

fn mongod_args(sts: &StatefulSet) -> Vec<String> {
    sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
        .args
        .clone()
        .unwrap_or_default()
}

#[tokio::test]
async fn test_first_pass_creates_workload_and_service() {
    let world = MockWorld::new(test_cluster("fresh", vec![ReplsetSpec::new("rs0", 3)]));
    let ctx = world.context();

    let action = reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(REQUEUE_INITIALIZING));

    let sts = world.statefulset("fresh-rs0").unwrap();
    assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
    assert!(mongod_image(&sts).ends_with(":6.0.4"));
    assert!(mongod_args(&sts).contains(&"--replSet=rs0".to_string()));
    assert!(world.state().services.contains_key("fresh-rs0"));
    assert_eq!(world.state().statefulset_replaces, 0);
}

/// Spec changes flow into the live StatefulSet; a second pass is a no-op.
#[tokio::test]
async fn test_workload_converges_to_spec() {
    let world = MockWorld::new(test_cluster("grow", vec![ReplsetSpec::new("rs0", 3)]));
    let ctx = world.context();
    reconcile(world.cluster(), ctx.clone()).await.unwrap();

    {
        let mut state = world.state();
        let cluster = state.cluster.as_mut().unwrap();
        cluster.spec.version = "7.0.2".to_string();
        cluster.spec.replsets[0].size = 5;
        cluster.metadata.generation = Some(2);
    }
    reconcile(world.cluster(), ctx.clone()).await.unwrap();

    let sts = world.statefulset("grow-rs0").unwrap();
    assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(5));
    assert!(mongod_image(&sts).ends_with(":7.0.2"));
    assert_eq!(world.state().statefulset_replaces, 1);
    assert_eq!(world.status().observed_generation, Some(2));

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(world.state().statefulset_replaces, 1);
}

/// A memory limit adds the WiredTiger cache size to the mongod arguments.
#[tokio::test]
async fn test_memory_limit_sets_cache_size() {
    let mut rs0 = ReplsetSpec::new("rs0", 3);
    rs0.resources.limits.memory = Some("2Gi".to_string());
    let world = MockWorld::new(test_cluster("cache", vec![rs0]));
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    let sts = world.statefulset("cache-rs0").unwrap();
    assert!(
        mongod_args(&sts)
            .iter()
            .any(|a| a.starts_with("--wiredTigerCacheSizeGB="))
    );
}

/// One broken replica set does not stop the others from converging.
#[tokio::test]
async fn test_replset_failure_is_isolated() {
    let mut bad = ReplsetSpec::new("rs0", 3);
    bad.resources.limits.memory = Some("lots".to_string());
    let good = ReplsetSpec::new("rs1", 3);
    let world = MockWorld::new(test_cluster("mixed", vec![bad, good]));
    let ctx = world.context();

    let err = reconcile(world.cluster(), ctx.clone()).await.unwrap_err();
    match &err {
        Error::Replset { name, source } => {
            assert_eq!(name, "rs0");
            assert!(matches!(**source, Error::Config(_)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!err.is_retryable());

    assert!(world.statefulset("mixed-rs0").is_none());
    assert!(world.statefulset("mixed-rs1").is_some());
    assert!(world.state().services.contains_key("mixed-rs1"));
    let status = world.status();
    assert!(status.replset("rs1").is_some());
    assert_eq!(
        get_condition_reason(&status.conditions, "Ready"),
        Some("ReplsetError")
    );
}

#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let world = MockWorld::new(test_cluster("empty", vec![]));
    let ctx = world.context();

    let err = reconcile(world.cluster(), ctx.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(world.state().statefulsets.is_empty());
    assert_eq!(
        get_condition_reason(&world.status().conditions, "Ready"),
        Some("ValidationFailed")
    );
}

/// A StatefulSet created behind our back is adopted instead of failing.
#[tokio::test]
async fn test_existing_workload_is_converged() {
    let world = MockWorld::new(test_cluster("adopt", vec![ReplsetSpec::new("rs0", 3)]));
    let ctx = world.context();
    reconcile(world.cluster(), ctx.clone()).await.unwrap();

    {
        let mut state = world.state();
        let sts = state.statefulsets.get_mut("adopt-rs0").unwrap();
        sts.spec.as_mut().unwrap().replicas = Some(1);
    }
    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    let sts = world.statefulset("adopt-rs0").unwrap();
    assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
}

/// Deletion stops the background probes and forgets the cached pods.
#[tokio::test]
async fn test_deletion_stops_watchdog() {
    let world = MockWorld::new(test_cluster("gone", vec![ReplsetSpec::new("rs0", 3)]));
    world.add_pods("rs0", 3, true);
    world.state().initiated.insert("rs0".to_string());
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert!(ctx.watchdogs.is_running(NAMESPACE, "gone"));
    let key = PodCache::key(NAMESPACE, "gone");
    assert_eq!(ctx.pod_cache.get(&key).len(), 1);

    world.state().cluster.as_mut().unwrap().metadata.deletion_timestamp =
        Some(Time(k8s_openapi::chrono::Utc::now()));
    let action = reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(!ctx.watchdogs.is_running(NAMESPACE, "gone"));
    assert!(ctx.pod_cache.get(&key).is_empty());
    // Releasing the finalizer lets the deletion complete
    assert!(world.state().cluster.is_none());
}

/// A new cluster first gets the finalizer; the workload follows on the next pass.
#[tokio::test]
async fn test_finalizer_added_before_any_work() {
    let mut cluster = test_cluster("fresh", vec![ReplsetSpec::new("rs0", 3)]);
    cluster.metadata.finalizers = None;
    let world = MockWorld::new(cluster);
    let ctx = world.context();

    let action = reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(REQUEUE_FINALIZER));
    assert_eq!(world.cluster().finalizers(), &[FINALIZER.to_string()]);
    assert!(world.state().statefulsets.is_empty());
    assert_eq!(world.status_writes(), 0);

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert!(world.statefulset("fresh-rs0").is_some());
}

/// Deleting a cluster that never got the finalizer only cleans up locally.
#[tokio::test]
async fn test_deletion_without_finalizer() {
    let mut cluster = test_cluster("bare", vec![ReplsetSpec::new("rs0", 3)]);
    cluster.metadata.finalizers = None;
    cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    let world = MockWorld::new(cluster);
    let ctx = world.context();

    let action = reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(world.state().cluster.is_some());
    assert!(world.state().statefulsets.is_empty());
}
