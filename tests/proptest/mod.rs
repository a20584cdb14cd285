// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for mongodb-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use proptest::prelude::*;

use mongodb_operator::Platform;
use mongodb_operator::controller::replset_init::is_init_eligible;
use mongodb_operator::controller::state_diff::diff_workload;
use mongodb_operator::crd::{
    MemberStatus, MongoDbCluster, MongoDbClusterSpec, MongoDbClusterStatus, ReplsetSpec,
};
use mongodb_operator::controller::status::StatusAggregator;
use mongodb_operator::resources::quantity::{MEMORY, ParsedQuantity};
use mongodb_operator::resources::{DesiredWorkload, PlatformFacts, build_desired_workload};

/// Strategy for memory quantities in Mi.
fn memory_mi() -> impl Strategy<Value = u32> {
    1..=8192u32
}

/// Strategy for replica set sizes.
fn replset_size() -> impl Strategy<Value = i32> {
    1..=7i32
}

fn cluster(status: Option<MongoDbClusterStatus>) -> MongoDbCluster {
    MongoDbCluster {
        metadata: ObjectMeta {
            name: Some("prop".to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: MongoDbClusterSpec::default(),
        status,
    }
}

fn workload(size: i32, request_mi: u32, limit_mi: u32) -> DesiredWorkload {
    let mut replset = ReplsetSpec::new("rs0", size);
    replset.resources.requests.memory = Some(format!("{}Mi", request_mi));
    replset.resources.limits.memory = Some(format!("{}Mi", limit_mi));
    let mut c = cluster(None);
    c.spec.replsets = vec![replset.clone()];
    build_desired_workload(&c, &replset, PlatformFacts::from(Platform::Kubernetes)).unwrap()
}

fn memory_limit(sts: &StatefulSet) -> ParsedQuantity {
    let container = &sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
    let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
    ParsedQuantity::from_quantity(limits.get(MEMORY)).unwrap()
}

fn mi(value: u32) -> ParsedQuantity {
    ParsedQuantity::from_quantity(Some(&Quantity(format!("{}Mi", value)))).unwrap()
}

proptest! {
    /// Property: a desired limit is applied exactly when it is not below the
    /// updated request; otherwise the live limit survives.
    #[test]
    fn test_limit_never_below_request(
        live_request in memory_mi(),
        live_limit in memory_mi(),
        request in memory_mi(),
        limit in memory_mi(),
    ) {
        let mut live = workload(3, live_request, live_limit).statefulset;
        let desired = workload(3, request, limit);
        diff_workload(&mut live, &desired).unwrap();

        if limit >= request {
            prop_assert_eq!(memory_limit(&live), mi(limit));
        } else {
            prop_assert_eq!(memory_limit(&live), mi(live_limit));
        }
    }

    /// Property: one diff converges the workload; a second finds nothing.
    #[test]
    fn test_diff_converges(
        live_size in replset_size(),
        size in replset_size(),
        request in memory_mi(),
        limit in memory_mi(),
    ) {
        let mut live = workload(live_size, 512, 1024).statefulset;
        let desired = workload(size, request, limit);

        diff_workload(&mut live, &desired).unwrap();
        prop_assert_eq!(live.spec.as_ref().unwrap().replicas, Some(size));

        let again = diff_workload(&mut live, &desired).unwrap();
        prop_assert!(!again.changed(), "second diff changed {:?}", again.changes);
    }

    /// Property: the quiescence gate opens only strictly after the window.
    #[test]
    fn test_quiescence_gate(
        elapsed_ms in 0u64..120_000,
        window_s in 0u64..90,
        pods in 0usize..7,
        initialized in any::<bool>(),
    ) {
        let elapsed = Duration::from_millis(elapsed_ms);
        let window = Duration::from_secs(window_s);
        let eligible = is_init_eligible(initialized, pods, elapsed, window);
        prop_assert_eq!(eligible, !initialized && pods > 0 && elapsed > window);
    }

    /// Property: nothing the aggregator does resets an initialized flag.
    #[test]
    fn test_initialized_is_sticky(
        member_counts in prop::collection::vec(0usize..5, 1..6),
    ) {
        let mut status = MongoDbClusterStatus::default();
        status.replset_mut("rs0").mark_initialized();
        let c = cluster(Some(status));
        let mut aggregator = StatusAggregator::new(&c);

        for count in member_counts {
            let pods: Vec<String> = (0..count).map(|i| format!("prop-rs0-{}", i)).collect();
            let members: Vec<MemberStatus> = pods
                .iter()
                .map(|p| MemberStatus { name: p.clone(), version: "6.0.4".to_string() })
                .collect();
            aggregator.aggregate("rs0", &pods, &members);
            prop_assert!(!aggregator.mark_initialized("rs0"));
            prop_assert!(aggregator.is_initialized("rs0"));
        }
    }

    /// Property: binary and decimal spellings of the same amount compare equal.
    #[test]
    fn test_quantity_units_agree(value in 1u32..100_000) {
        let ki = format!("{}Ki", u64::from(value) * 1024);
        let mi = format!("{}Mi", value);
        prop_assert_eq!(
            ki.parse::<ParsedQuantity>().unwrap(),
            mi.parse::<ParsedQuantity>().unwrap()
        );
        let milli = format!("{}m", u64::from(value) * 1000);
        prop_assert_eq!(
            milli.parse::<ParsedQuantity>().unwrap(),
            value.to_string().parse::<ParsedQuantity>().unwrap()
        );
    }
}
