//! Reconciliation loop for MongoDbCluster.
//!
//! This module contains the reconcile function called by the controller for
//! every MongoDbCluster. It validates the spec, runs an independent pass for
//! each replica set and summarizes the result in the status conditions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::client::Credentials;
use crate::controller::cluster_validation::validate_spec;
use crate::controller::context::{Context, FINALIZER};
use crate::controller::error::Error;
use crate::controller::replset_reconciler::{ReplsetOutcome, WorkloadAction, reconcile_replset};
use crate::controller::status::StatusAggregator;
use crate::controller::watchdog::PodCache;
use crate::crd::{Condition, MongoDbCluster};
use crate::resources::common::{cluster_namespace, users_secret_name};

/// Requeue interval while a replica set is still waiting for initiation
pub const REQUEUE_INITIALIZING: Duration = Duration::from_secs(15);
/// Requeue interval once every replica set is initialized
pub const REQUEUE_STEADY: Duration = Duration::from_secs(60);
/// Requeue interval right after the finalizer was added
pub const REQUEUE_FINALIZER: Duration = Duration::from_secs(1);

/// Reconcile a MongoDbCluster
///
/// Safe to call repeatedly. The controller runtime serializes calls for the
/// same object.
pub async fn reconcile(obj: Arc<MongoDbCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = cluster_namespace(&obj);

    debug!(name = %name, namespace = %namespace, "Reconciling MongoDbCluster");

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &namespace).await;
    }

    // Ensure finalizer is present
    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, "Adding finalizer");
        ctx.store.add_cluster_finalizer(&namespace, &name).await?;
        return Ok(Action::requeue(REQUEUE_FINALIZER));
    }

    let mut status = StatusAggregator::new(&obj);
    let generation = obj.metadata.generation;

    if let Err(e) = validate_spec(&obj) {
        error!(name = %name, error = %e, "Validation failed");
        ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(e.to_string()))
            .await;
        status.set_condition(Condition::ready(
            false,
            "ValidationFailed",
            &e.to_string(),
            generation,
        ));
        status.persist(ctx.store.as_ref()).await?;
        return Err(e);
    }

    let credentials = read_credentials(&obj, &ctx, &namespace).await?;

    // Replica sets are independent: a failed pass is logged and the next
    // replica set still gets its turn.
    let mut outcomes: Vec<ReplsetOutcome> = Vec::new();
    let mut failures: Vec<Error> = Vec::new();
    for replset in &obj.spec.replsets {
        match reconcile_replset(&ctx, &obj, replset, credentials.as_ref(), &mut status).await {
            Ok(outcome) => {
                if outcome.workload == WorkloadAction::Created {
                    ctx.publish_normal_event(
                        &obj,
                        "StatefulSetCreated",
                        "CreateResources",
                        Some(format!("Created StatefulSet for replset {}", replset.name)),
                    )
                    .await;
                }
                outcomes.push(outcome);
            }
            Err(e) => {
                warn!(name = %name, replset = %replset.name, error = %e, "Replset pass failed");
                ctx.publish_warning_event(
                    &obj,
                    "ReplsetReconcileFailed",
                    "Reconciling",
                    Some(format!("replset {}: {}", replset.name, e)),
                )
                .await;
                failures.push(e.in_replset(&replset.name));
            }
        }
    }

    let total = obj.spec.replsets.len();
    let initialized = obj
        .spec
        .replsets
        .iter()
        .filter(|rs| status.is_initialized(&rs.name))
        .count();
    set_conditions(&mut status, total, initialized, &failures, generation);
    status.set_observed_generation(generation);
    status.persist(ctx.store.as_ref()).await?;

    if let Some(health_state) = &ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
    }

    let requeue = if initialized < total {
        REQUEUE_INITIALIZING
    } else {
        REQUEUE_STEADY
    };

    info!(
        name = %name,
        replsets = total,
        initialized = initialized,
        failed = failures.len(),
        "Reconciled MongoDbCluster"
    );

    match failures.into_iter().next() {
        Some(e) => Err(e),
        None => Ok(Action::requeue(requeue)),
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<MongoDbCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = cluster_namespace(&obj);

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}

/// Read the admin credentials. A missing secret is not fatal: probes then run
/// unauthenticated and simply fail until the secret shows up.
async fn read_credentials(
    obj: &MongoDbCluster,
    ctx: &Context,
    namespace: &str,
) -> Result<Option<Credentials>, Error> {
    let secret = users_secret_name(obj);
    match ctx.credentials.read_credentials(namespace, &secret).await {
        Ok(credentials) => Ok(Some(credentials)),
        Err(e) if e.is_not_found() => {
            warn!(secret = %secret, error = %e, "Users secret not available");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn set_conditions(
    status: &mut StatusAggregator,
    total: usize,
    initialized: usize,
    failures: &[Error],
    generation: Option<i64>,
) {
    if let Some(first) = failures.first() {
        status.set_condition(Condition::ready(
            false,
            "ReplsetError",
            &first.to_string(),
            generation,
        ));
    } else if initialized == total {
        status.set_condition(Condition::ready(
            true,
            "AllInitialized",
            &format!("{}/{} replsets initialized", initialized, total),
            generation,
        ));
    } else {
        status.set_condition(Condition::ready(
            false,
            "Initializing",
            &format!("{}/{} replsets initialized", initialized, total),
            generation,
        ));
    }

    if initialized < total {
        status.set_condition(Condition::progressing(
            true,
            "WaitingForInitiation",
            "Waiting for replica set initiation",
            generation,
        ));
    } else {
        status.set_condition(Condition::progressing(
            false,
            "Stable",
            "All replica sets initiated",
            generation,
        ));
    }
}

/// Handle deletion of a MongoDbCluster
///
/// Owned objects go away through their owner references; only the
/// in-process state for the cluster needs cleaning up before the finalizer
/// is released.
async fn handle_deletion(
    obj: &MongoDbCluster,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");
    ctx.watchdogs.stop(namespace, &name);
    ctx.pod_cache.remove(&PodCache::key(namespace, &name));

    if obj.finalizers().iter().any(|f| f == FINALIZER) {
        ctx.store.remove_cluster_finalizer(namespace, &name).await?;
    }
    Ok(Action::await_change())
}
