//! Replica set bootstrap.
//!
//! A replica set is initiated once, from inside one of its own pods, where
//! mongod's localhost exception allows the first admin command without
//! credentials. The bootstrap is only attempted after the operator has been
//! up for the quiescence window, so freshly scheduled pods get a chance to
//! settle first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::platform::PodExecutor;
use crate::resources::statefulset::MONGOD_CONTAINER_NAME;

/// Bootstrap command run inside the chosen pod. Safe to run twice: it
/// exits successfully when the replica set is already initiated.
pub const INITIATOR_COMMAND: [&str; 2] = ["k8s-mongodb-initiator", "init"];

/// Whether the bootstrap may be attempted.
///
/// All of: not initialized yet, at least one pod, and the operator has been
/// running for strictly longer than the quiescence window.
pub fn is_init_eligible(
    initialized: bool,
    pod_count: usize,
    elapsed: Duration,
    window: Duration,
) -> bool {
    !initialized && pod_count > 0 && elapsed > window
}

/// Whether the mongod container of a pod is running and passed readiness.
pub fn is_mongod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == MONGOD_CONTAINER_NAME))
        .is_some_and(|c| c.ready && c.state.as_ref().is_some_and(|s| s.running.is_some()))
}

/// First pod, in listing order, whose mongod is running and ready.
pub fn first_eligible_pod(pods: &[Pod]) -> Option<&Pod> {
    pods.iter().find(|p| is_mongod_ready(p))
}

/// Run the bootstrap command on the first eligible pod.
///
/// Returns the name of the pod it ran on. Fails with
/// [`Error::NoEligibleMember`] when no pod qualifies; an exec failure is
/// returned as is and the replica set stays uninitialized.
pub async fn initiate_replset(
    executor: &dyn PodExecutor,
    namespace: &str,
    replset: &str,
    pods: &[Pod],
) -> Result<String> {
    let pod = first_eligible_pod(pods).ok_or_else(|| Error::NoEligibleMember(replset.to_string()))?;
    let pod_name = pod.name_any();

    info!(replset = %replset, pod = %pod_name, "Initiating replica set");
    executor
        .exec(
            namespace,
            &pod_name,
            MONGOD_CONTAINER_NAME,
            INITIATOR_COMMAND.iter().map(|s| s.to_string()).collect(),
        )
        .await?;
    info!(replset = %replset, pod = %pod_name, "Replica set initiated");
    Ok(pod_name)
}

/// In-process single-flight guard for replica set bootstraps.
///
/// Keys are `namespace/cluster/replset`. Only one holder per key at a time;
/// the key is released when the [`InitPermit`] is dropped.
#[derive(Clone, Debug, Default)]
pub struct InitGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl InitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(namespace: &str, cluster: &str, replset: &str) -> String {
        format!("{}/{}/{}", namespace, cluster, replset)
    }

    /// Take the key, or `None` if another bootstrap holds it.
    pub fn try_acquire(&self, key: &str) -> Option<InitPermit> {
        let mut in_flight = lock(&self.in_flight);
        if !in_flight.insert(key.to_string()) {
            debug!(key = %key, "Bootstrap already in flight");
            return None;
        }
        Some(InitPermit {
            key: key.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        lock(&self.in_flight).contains(key)
    }
}

/// Held while a bootstrap runs.
#[derive(Debug)]
pub struct InitPermit {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InitPermit {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.key);
    }
}

// The set stays consistent even if a holder panicked.
fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}
