//! Status aggregation scenarios: member refresh and write suppression.

use std::time::Duration;

use mongodb_operator::client::Credentials;
use mongodb_operator::controller::cluster_reconciler::reconcile;
use mongodb_operator::controller::status::{get_condition_reason, is_condition_true};
use mongodb_operator::crd::{MemberStatus, ReplsetSpec};

use crate::mock_state::{MONGO_VERSION, MockWorld, NAMESPACE, test_cluster};

fn member(world: &MockWorld, pod: &str) -> MemberStatus {
    MemberStatus {
        name: world.address("rs0", pod),
        version: MONGO_VERSION.to_string(),
    }
}

/// A steady cluster with initiated rs0 and three answering members.
fn steady_world(name: &str) -> MockWorld {
    let world = MockWorld::new(test_cluster(name, vec![ReplsetSpec::new("rs0", 3)]));
    world.add_pods("rs0", 3, true);
    world.state().initiated.insert("rs0".to_string());
    world
}

#[tokio::test]
async fn test_members_recorded_in_listing_order() {
    let world = steady_world("members");
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();

    let status = world.status();
    let rs0 = status.replset("rs0").unwrap();
    assert_eq!(
        rs0.members,
        vec![
            member(&world, "members-rs0-0"),
            member(&world, "members-rs0-1"),
            member(&world, "members-rs0-2"),
        ]
    );
    assert!(is_condition_true(&status.conditions, "Ready"));
    assert_eq!(
        get_condition_reason(&status.conditions, "Ready"),
        Some("AllInitialized")
    );
    assert_eq!(status.observed_generation, Some(1));

    ctx.watchdogs.stop_all();
}

/// A member that does not answer is left out; the others are still recorded.
#[tokio::test]
async fn test_partial_member_refresh() {
    let world = steady_world("partial");
    let down = world.address("rs0", "partial-rs0-1");
    world.state().down.insert(down);
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();

    let status = world.status();
    let rs0 = status.replset("rs0").unwrap();
    assert_eq!(rs0.pods.len(), 3);
    assert_eq!(
        rs0.members,
        vec![
            member(&world, "partial-rs0-0"),
            member(&world, "partial-rs0-2"),
        ]
    );

    ctx.watchdogs.stop_all();
}

/// Reconciling unchanged inputs does not write the status again.
#[tokio::test]
async fn test_identical_inputs_skip_status_write() {
    let world = steady_world("quiet");
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    let writes = world.status_writes();
    assert!(writes >= 1);

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(world.status_writes(), writes);

    ctx.watchdogs.stop_all();
}

/// A changed member list is written exactly once.
#[tokio::test]
async fn test_member_change_written_once() {
    let world = steady_world("change");
    let ctx = world.context();
    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    let writes = world.status_writes();

    let down = world.address("rs0", "change-rs0-2");
    world.state().down.insert(down);
    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert_eq!(world.status_writes(), writes + 1);
    assert_eq!(world.status().replset("rs0").unwrap().members.len(), 2);

    ctx.watchdogs.stop_all();
}

/// Losing every member never clears the initialized flag.
#[tokio::test]
async fn test_initialized_is_monotonic() {
    let world = steady_world("sticky");
    let ctx = world.context();
    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert!(world.status().replset("rs0").unwrap().initialized);

    {
        let mut state = world.state();
        state.initiated.clear();
        for ordinal in 0..3 {
            let pod = format!("sticky-rs0-{}", ordinal);
            let address = world_address(&state, &pod);
            state.down.insert(address);
        }
    }
    reconcile(world.cluster(), ctx.clone()).await.unwrap();

    let status = world.status();
    let rs0 = status.replset("rs0").unwrap();
    assert!(rs0.initialized);
    assert!(rs0.members.is_empty());

    ctx.watchdogs.stop_all();
}

// Same address format the reconciler builds, without re-locking the world.
fn world_address(state: &crate::mock_state::WorldState, pod: &str) -> String {
    let cluster = state.cluster.as_ref().unwrap();
    mongodb_operator::resources::common::member_address(pod, cluster, &cluster.spec.replsets[0])
}

/// Without the users secret the probes run unauthenticated and the pass
/// still completes.
#[tokio::test]
async fn test_missing_users_secret() {
    let world = MockWorld::new(test_cluster("nosecret", vec![ReplsetSpec::new("rs0", 3)]));
    world.state().credentials = None;
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert!(world.statefulset("nosecret-rs0").is_some());
    let status = world.status();
    assert_eq!(
        get_condition_reason(&status.conditions, "Ready"),
        Some("Initializing")
    );
    assert!(is_condition_true(&status.conditions, "Progressing"));
}

/// Writing against a stale resourceVersion is a conflict, retried later.
#[tokio::test]
async fn test_stale_status_write_conflicts() {
    let world = MockWorld::new(test_cluster("stale", vec![ReplsetSpec::new("rs0", 3)]));
    let ctx = world.context();
    let stale = world.cluster();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    world.add_pods("rs0", 1, false);
    let err = reconcile(stale, ctx.clone()).await.unwrap_err();
    assert!(err.is_retryable());
}

/// The background monitor uses the users secret once it shows up, even though
/// it was started while the secret was missing.
#[tokio::test(start_paused = true)]
async fn test_watchdog_uses_late_users_secret() {
    let world = steady_world("late");
    world.state().credentials = None;
    let ctx = world.context();

    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    assert!(ctx.watchdogs.is_running(NAMESPACE, "late"));

    world.state().credentials = Some(Credentials {
        username: "clusterAdmin".to_string(),
        password: "late-secret".to_string(),
    });
    reconcile(world.cluster(), ctx.clone()).await.unwrap();
    world.state().dials.clear();

    tokio::time::sleep(ctx.config.watchdog_interval() + Duration::from_secs(1)).await;

    let dials = world.state().dials.clone();
    assert_eq!(dials.len(), 3);
    assert!(dials.iter().all(|d| {
        d.credentials.as_ref().map(|c| c.password.as_str()) == Some("late-secret")
    }));

    ctx.watchdogs.stop_all();
}
