//! Shared context for the controller.
//!
//! The Context is built once at startup and handed to every reconciliation.
//! It holds the platform and database collaborators, the operator
//! configuration, and the process-wide state the reconciler relies on: the
//! start time used for the bootstrap quiescence window, the bootstrap
//! single-flight guard, the watchdog registry and the pod cache.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tokio::time::Instant;

use crate::client::{MemberConnector, MongoConnector};
use crate::config::OperatorConfig;
use crate::controller::platform::{CredentialStore, KubePlatform, ObjectStore, PodExecutor};
use crate::controller::replset_init::InitGuard;
use crate::controller::watchdog::{PodCache, WatchdogRegistry};
use crate::crd::MongoDbCluster;
use crate::health::HealthState;
use crate::resources::PlatformFacts;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "mongodb-operator";

/// Finalizer that keeps a deleted cluster around until its watchdog is stopped
pub const FINALIZER: &str = "mongodb.smoketurner.com/finalizer";

/// External collaborators used by the reconciler.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub executor: Arc<dyn PodExecutor>,
    pub credentials: Arc<dyn CredentialStore>,
    pub connector: Arc<dyn MemberConnector>,
}

impl Collaborators {
    /// Kubernetes API for the platform, the `mongodb` driver for members.
    pub fn kube(client: Client) -> Self {
        let platform = Arc::new(KubePlatform::new(client));
        Self {
            store: platform.clone(),
            executor: platform.clone(),
            credentials: platform,
            connector: Arc::new(MongoConnector),
        }
    }
}

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub executor: Arc<dyn PodExecutor>,
    pub credentials: Arc<dyn CredentialStore>,
    pub connector: Arc<dyn MemberConnector>,
    pub config: OperatorConfig,
    /// When the operator started; the quiescence window counts from here
    pub started_at: Instant,
    pub init_guard: InitGuard,
    pub watchdogs: WatchdogRegistry,
    pub pod_cache: PodCache,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Kubernetes client for events; `None` disables events
    client: Option<Client>,
    /// Event reporter identity
    reporter: Reporter,
}

impl Context {
    /// Create the production context on a Kubernetes client.
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let mut ctx = Self::with_collaborators(
            Collaborators::kube(client.clone()),
            config,
            health_state,
        );
        ctx.client = Some(client);
        ctx
    }

    /// Create a context on arbitrary collaborators, without event publishing.
    pub fn with_collaborators(
        collaborators: Collaborators,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            store: collaborators.store,
            executor: collaborators.executor,
            credentials: collaborators.credentials,
            connector: collaborators.connector,
            config,
            started_at: Instant::now(),
            init_guard: InitGuard::new(),
            watchdogs: WatchdogRegistry::new(),
            pod_cache: PodCache::new(),
            health_state,
            client: None,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Time since the operator started.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn platform_facts(&self) -> PlatformFacts {
        PlatformFacts::from(self.config.platform)
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Option<Recorder> {
        self.client
            .as_ref()
            .map(|client| Recorder::new(client.clone(), self.reporter.clone()))
    }

    /// Publish a normal event for a cluster
    pub async fn publish_normal_event(
        &self,
        cluster: &MongoDbCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish_event(cluster, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a cluster
    pub async fn publish_warning_event(
        &self,
        cluster: &MongoDbCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish_event(cluster, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish_event(
        &self,
        cluster: &MongoDbCluster,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let Some(recorder) = self.recorder() else {
            tracing::debug!(reason = %reason, "Event publishing disabled");
            return;
        };
        let object_ref = cluster.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
