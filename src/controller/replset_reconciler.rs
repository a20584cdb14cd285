//! One reconciliation pass for a single replica set.
//!
//! In order:
//! 1. Create the StatefulSet if it does not exist yet
//! 2. Converge the owned fields of the live StatefulSet
//! 3. List the replica set's pods
//! 4. Probe the members and refresh the persisted status
//! 5. Initiate the replica set once it is eligible
//! 6. Create the headless Service if it does not exist yet
//!
//! A failure in one replica set's pass never touches another replica set.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::Credentials;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::platform::CreateOutcome;
use crate::controller::replset_init::{self, InitGuard};
use crate::controller::state_diff::apply_workload_diff;
use crate::controller::status::StatusAggregator;
use crate::controller::topology_probe::TopologyProber;
use crate::controller::watchdog::{PodCache, WatchdogConfig};
use crate::crd::{MongoDbCluster, ReplsetSpec};
use crate::resources::common::{cluster_namespace, member_address, replset_labels};
use crate::resources::services::generate_headless_service;
use crate::resources::statefulset::{DesiredWorkload, build_desired_workload};

/// What happened to the StatefulSet during a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadAction {
    Created,
    Updated,
    Unchanged,
}

/// Summary of a replica set pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplsetOutcome {
    pub name: String,
    pub workload: WorkloadAction,
    pub initialized: bool,
    pub pods: usize,
    pub members_up: usize,
    /// Pod the bootstrap ran on during this pass
    pub initiated_on: Option<String>,
}

/// Run one pass for `replset`.
///
/// `status` is the cluster's working status; this pass only touches the
/// entry for `replset` and persists it when it changed.
pub async fn reconcile_replset(
    ctx: &Context,
    cluster: &MongoDbCluster,
    replset: &ReplsetSpec,
    credentials: Option<&Credentials>,
    status: &mut StatusAggregator,
) -> Result<ReplsetOutcome> {
    let namespace = cluster_namespace(cluster);
    let cluster_name = cluster.name_any();

    // 1-2. Workload
    let desired = build_desired_workload(cluster, replset, ctx.platform_facts())?;
    let workload = ensure_workload(ctx, &namespace, &desired).await?;

    // 3. Pods
    let pods = ctx
        .store
        .list_pods(&namespace, &replset_labels(cluster, replset))
        .await?;
    let pod_names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
    let addresses: Vec<String> = pod_names
        .iter()
        .map(|p| member_address(p, cluster, replset))
        .collect();
    ctx.pod_cache.update(
        &PodCache::key(&namespace, &cluster_name),
        &replset.name,
        addresses.clone(),
    );

    // 4. Status
    let prober = TopologyProber::new(
        ctx.connector.as_ref(),
        credentials.cloned(),
        ctx.config.dial_timeout(),
    );
    let was_initialized = status.is_initialized(&replset.name);
    let initialized = prober
        .check_initialized(status.replset_mut(&replset.name), &replset.name, &addresses)
        .await;
    if initialized && !was_initialized {
        status.touch();
    }

    let refresh = prober.refresh_members(&addresses).await;
    status.aggregate(&replset.name, &pod_names, &refresh.members);
    if let Some(health) = &ctx.health_state {
        health.metrics.set_members_desired(
            &namespace,
            &cluster_name,
            &replset.name,
            i64::from(replset.size),
        );
        health.metrics.record_member_probe(
            &namespace,
            &cluster_name,
            &replset.name,
            refresh.members.len(),
            refresh.unreachable.len(),
        );
    }
    status.persist(ctx.store.as_ref()).await?;

    // 5. Bootstrap
    let window = replset
        .init_wait_seconds
        .map(Duration::from_secs)
        .unwrap_or_else(|| ctx.config.init_wait());
    let mut initiated_on = None;
    let mut init_error = None;
    if replset_init::is_init_eligible(initialized, pods.len(), ctx.uptime(), window) {
        match initiate(ctx, cluster, replset, &pods, status).await {
            Ok(pod) => initiated_on = pod,
            Err(Error::NoEligibleMember(name)) => {
                info!(replset = %name, "Waiting for a running and ready mongod before initiating");
            }
            Err(e) => init_error = Some(e),
        }
    } else if !initialized {
        debug!(
            replset = %replset.name,
            pods = pods.len(),
            uptime_secs = ctx.uptime().as_secs(),
            window_secs = window.as_secs(),
            "Replica set not eligible for initiation yet"
        );
    }

    let initialized = status.is_initialized(&replset.name);
    if initialized {
        start_watchdog(ctx, &namespace, &cluster_name, credentials);
    }

    // 6. Network endpoint
    let service = generate_headless_service(cluster, replset);
    if ctx.store.create_service(&service).await? == CreateOutcome::Created {
        info!(service = %service.name_any(), "Created headless Service");
    }

    if let Some(e) = init_error {
        return Err(e);
    }

    Ok(ReplsetOutcome {
        name: replset.name.clone(),
        workload,
        initialized,
        pods: pods.len(),
        members_up: refresh.members.len(),
        initiated_on,
    })
}

/// Create the StatefulSet if absent, otherwise converge it.
async fn ensure_workload(
    ctx: &Context,
    namespace: &str,
    desired: &DesiredWorkload,
) -> Result<WorkloadAction> {
    let live = match ctx.store.get_statefulset(namespace, &desired.name).await? {
        Some(live) => live,
        None => match ctx.store.create_statefulset(&desired.statefulset).await? {
            CreateOutcome::Created => {
                info!(statefulset = %desired.name, replicas = desired.replicas, "Created StatefulSet");
                return Ok(WorkloadAction::Created);
            }
            CreateOutcome::AlreadyExists => fetch_existing(ctx, namespace, &desired.name).await?,
        },
    };

    if apply_workload_diff(ctx.store.as_ref(), live, desired).await? {
        Ok(WorkloadAction::Updated)
    } else {
        Ok(WorkloadAction::Unchanged)
    }
}

// Someone else created it between our read and our create.
async fn fetch_existing(ctx: &Context, namespace: &str, name: &str) -> Result<StatefulSet> {
    debug!(statefulset = %name, "StatefulSet already exists, re-reading");
    ctx.store
        .get_statefulset(namespace, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("statefulset {}", name)))
}

/// Run the bootstrap under the single-flight guard.
///
/// Returns the pod it ran on, or `None` if another bootstrap for the same
/// replica set holds the guard or the replica set turned out initialized.
async fn initiate(
    ctx: &Context,
    cluster: &MongoDbCluster,
    replset: &ReplsetSpec,
    pods: &[k8s_openapi::api::core::v1::Pod],
    status: &mut StatusAggregator,
) -> Result<Option<String>> {
    let namespace = cluster_namespace(cluster);
    let key = InitGuard::key(&namespace, &cluster.name_any(), &replset.name);
    let Some(_permit) = ctx.init_guard.try_acquire(&key) else {
        return Ok(None);
    };
    if status.is_initialized(&replset.name) {
        return Ok(None);
    }

    let pod = match replset_init::initiate_replset(
        ctx.executor.as_ref(),
        &namespace,
        &replset.name,
        pods,
    )
    .await
    {
        Ok(pod) => pod,
        Err(e) => {
            if !matches!(e, Error::NoEligibleMember(_)) {
                warn!(replset = %replset.name, error = %e, "Replica set initiation failed");
                ctx.publish_warning_event(
                    cluster,
                    "InitiationFailed",
                    "Initiate",
                    Some(format!("replset {}: {}", replset.name, e)),
                )
                .await;
            }
            return Err(e);
        }
    };

    status.mark_initialized(&replset.name);
    status.persist(ctx.store.as_ref()).await?;

    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_initialization(&namespace, &cluster.name_any(), &replset.name);
    }
    ctx.publish_normal_event(
        cluster,
        "ReplsetInitialized",
        "Initiate",
        Some(format!("replset {} initiated on pod {}", replset.name, pod)),
    )
    .await;
    Ok(Some(pod))
}

fn start_watchdog(
    ctx: &Context,
    namespace: &str,
    cluster: &str,
    credentials: Option<&Credentials>,
) {
    let config = WatchdogConfig {
        namespace: namespace.to_string(),
        cluster: cluster.to_string(),
        interval: ctx.config.watchdog_interval(),
        dial_timeout: ctx.config.dial_timeout(),
        credentials: credentials.cloned(),
    };
    ctx.watchdogs.ensure_started(
        config,
        ctx.connector.clone(),
        ctx.pod_cache.clone(),
        ctx.health_state.clone(),
    );
}
