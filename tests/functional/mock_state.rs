//! In-memory world for driving the reconciler without a cluster.
//!
//! [`MockWorld`] stands in for every external collaborator at once: the
//! object store, pod exec, the users secret and the MongoDB members. Running
//! the bootstrap command in a pod flips the replica set to initiated, the way
//! the real initiator does, so multi-pass scenarios behave end to end.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, Pod, PodStatus,
    Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use mongodb_operator::OperatorConfig;
use mongodb_operator::client::{
    BuildInfo, Credentials, DialInfo, MemberConnector, MemberSession, MongoError,
};
use mongodb_operator::controller::context::{Collaborators, Context, FINALIZER};
use mongodb_operator::controller::error::{Error, Result};
use mongodb_operator::controller::platform::{
    CreateOutcome, CredentialStore, ObjectStore, PodExecutor,
};
use mongodb_operator::crd::{MongoDbCluster, MongoDbClusterSpec, MongoDbClusterStatus, ReplsetSpec};
use mongodb_operator::resources::LabelSet;
use mongodb_operator::resources::common::{LABEL_REPLSET, member_address, standard_labels};
use mongodb_operator::resources::statefulset::MONGOD_CONTAINER_NAME;

pub const NAMESPACE: &str = "default";
pub const MONGO_VERSION: &str = "6.0.4";

/// One recorded exec call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecCall {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
}

#[derive(Default)]
pub struct WorldState {
    pub cluster: Option<MongoDbCluster>,
    pub resource_version: u64,
    pub statefulsets: BTreeMap<String, StatefulSet>,
    pub services: BTreeMap<String, Service>,
    pub pods: Vec<Pod>,
    pub credentials: Option<Credentials>,
    pub exec_calls: Vec<ExecCall>,
    pub exec_fails: bool,
    pub status_writes: usize,
    pub statefulset_replaces: usize,
    /// Replica sets that answer when dialed as a set
    pub initiated: HashSet<String>,
    /// Member addresses that refuse connections
    pub down: HashSet<String>,
    /// Every connection attempt, in order
    pub dials: Vec<DialInfo>,
}

/// Shared fake of the platform and the database.
#[derive(Clone, Default)]
pub struct MockWorld {
    state: Arc<Mutex<WorldState>>,
}

impl MockWorld {
    pub fn new(cluster: MongoDbCluster) -> Self {
        let world = Self::default();
        {
            let mut state = world.state();
            state.resource_version = 1;
            let mut cluster = cluster;
            cluster.metadata.resource_version = Some("1".to_string());
            state.cluster = Some(cluster);
            state.credentials = Some(Credentials {
                username: "clusterAdmin".to_string(),
                password: "secret".to_string(),
            });
        }
        world
    }

    pub fn state(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap()
    }

    /// The cluster as the API server currently has it, status included.
    pub fn cluster(&self) -> Arc<MongoDbCluster> {
        Arc::new(self.state().cluster.clone().unwrap())
    }

    pub fn status(&self) -> MongoDbClusterStatus {
        self.state()
            .cluster
            .as_ref()
            .and_then(|c| c.status.clone())
            .unwrap_or_default()
    }

    pub fn statefulset(&self, name: &str) -> Option<StatefulSet> {
        self.state().statefulsets.get(name).cloned()
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.state().exec_calls.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    /// Add `count` pods for a replica set, named like StatefulSet pods.
    pub fn add_pods(&self, replset: &str, count: usize, ready: bool) {
        let cluster = self.cluster();
        let spec = replset_spec(&cluster, replset);
        let mut state = self.state();
        let start = state
            .pods
            .iter()
            .filter(|p| p.labels().get(LABEL_REPLSET).map(String::as_str) == Some(replset))
            .count();
        for ordinal in start..start + count {
            let name = format!("{}-{}-{}", cluster.name_any(), replset, ordinal);
            state.pods.push(mongod_pod(&cluster, &spec, &name, ready));
        }
    }

    /// Mark every pod of a replica set ready (or not).
    pub fn set_pods_ready(&self, replset: &str, ready: bool) {
        let cluster = self.cluster();
        let spec = replset_spec(&cluster, replset);
        let mut state = self.state();
        for pod in state.pods.iter_mut() {
            if pod.labels().get(LABEL_REPLSET).map(String::as_str) == Some(replset) {
                *pod = mongod_pod(&cluster, &spec, &pod.name_any(), ready);
            }
        }
    }

    /// Address the reconciler uses for a pod of a replica set.
    pub fn address(&self, replset: &str, pod: &str) -> String {
        let cluster = self.cluster();
        member_address(pod, &cluster, &replset_spec(&cluster, replset))
    }

    pub fn context(&self) -> Arc<Context> {
        self.context_with(OperatorConfig::default())
    }

    pub fn context_with(&self, config: OperatorConfig) -> Arc<Context> {
        let collaborators = Collaborators {
            store: Arc::new(self.clone()),
            executor: Arc::new(self.clone()),
            credentials: Arc::new(self.clone()),
            connector: Arc::new(self.clone()),
        };
        Arc::new(Context::with_collaborators(collaborators, config, None))
    }
}

fn replset_spec(cluster: &MongoDbCluster, name: &str) -> ReplsetSpec {
    cluster
        .spec
        .replsets
        .iter()
        .find(|rs| rs.name == name)
        .cloned()
        .unwrap_or_else(|| ReplsetSpec::new(name, 3))
}

/// A cluster with the given replica sets.
pub fn test_cluster(name: &str, replsets: Vec<ReplsetSpec>) -> MongoDbCluster {
    MongoDbCluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{}-uid", name)),
            generation: Some(1),
            finalizers: Some(vec![FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: MongoDbClusterSpec {
            version: MONGO_VERSION.to_string(),
            replsets,
            ..Default::default()
        },
        status: None,
    }
}

/// A pod whose mongod container is running, and ready when `ready` is set.
pub fn mongod_pod(cluster: &MongoDbCluster, replset: &ReplsetSpec, name: &str, ready: bool) -> Pod {
    let state = if ready {
        ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        }
    } else {
        ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ContainerCreating".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(standard_labels(cluster, replset).into_map()),
            ..Default::default()
        },
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: MONGOD_CONTAINER_NAME.to_string(),
                ready,
                state: Some(state),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ObjectStore for MockWorld {
    async fn get_statefulset(&self, _namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.state().statefulsets.get(name).cloned())
    }

    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<CreateOutcome> {
        let mut state = self.state();
        let name = statefulset.name_any();
        if state.statefulsets.contains_key(&name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let mut stored = statefulset.clone();
        stored.metadata.resource_version = Some("1".to_string());
        state.statefulsets.insert(name, stored);
        Ok(CreateOutcome::Created)
    }

    async fn replace_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet> {
        let mut state = self.state();
        let name = statefulset.name_any();
        let current = state
            .statefulsets
            .get(&name)
            .ok_or_else(|| Error::NotFound(format!("statefulset {}", name)))?;
        if current.metadata.resource_version != statefulset.metadata.resource_version {
            return Err(Error::Conflict(format!("statefulset {}", name)));
        }
        let next: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
            + 1;
        let mut stored = statefulset.clone();
        stored.metadata.resource_version = Some(next.to_string());
        state.statefulsets.insert(name, stored.clone());
        state.statefulset_replaces += 1;
        Ok(stored)
    }

    async fn list_pods(&self, _namespace: &str, selector: &LabelSet) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|p| selector.matches(p.labels()))
            .cloned()
            .collect())
    }

    async fn create_service(&self, service: &Service) -> Result<CreateOutcome> {
        let mut state = self.state();
        let name = service.name_any();
        if state.services.contains_key(&name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        state.services.insert(name, service.clone());
        Ok(CreateOutcome::Created)
    }

    async fn add_cluster_finalizer(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.resource_version += 1;
        let version = state.resource_version.to_string();
        let cluster = state
            .cluster
            .as_mut()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        cluster.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        cluster.metadata.resource_version = Some(version);
        Ok(())
    }

    /// Once the last finalizer of a deleted cluster is gone, so is the cluster.
    async fn remove_cluster_finalizer(&self, _namespace: &str, _name: &str) -> Result<()> {
        let mut state = self.state();
        let deleting = state
            .cluster
            .as_ref()
            .is_some_and(|c| c.metadata.deletion_timestamp.is_some());
        if deleting {
            state.cluster = None;
        } else if let Some(cluster) = state.cluster.as_mut() {
            cluster.metadata.finalizers = None;
        }
        Ok(())
    }

    async fn replace_cluster_status(
        &self,
        _namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &MongoDbClusterStatus,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        let current = state.resource_version.to_string();
        if let Some(expected) = resource_version
            && expected != current
        {
            return Err(Error::Conflict(format!("mongodbcluster {}", name)));
        }
        state.resource_version += 1;
        let version = state.resource_version.to_string();
        let cluster = state
            .cluster
            .as_mut()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        cluster.status = Some(status.clone());
        cluster.metadata.resource_version = Some(version.clone());
        state.status_writes += 1;
        Ok(Some(version))
    }
}

#[async_trait]
impl PodExecutor for MockWorld {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state();
        state.exec_calls.push(ExecCall {
            pod: pod.to_string(),
            container: container.to_string(),
            command,
        });
        if state.exec_fails {
            return Err(Error::Exec {
                pod: pod.to_string(),
                message: "command terminated with exit code 1".to_string(),
            });
        }
        let replset = state
            .pods
            .iter()
            .find(|p| p.name_any() == pod)
            .and_then(|p| p.labels().get(LABEL_REPLSET).cloned());
        if let Some(replset) = replset {
            state.initiated.insert(replset);
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MockWorld {
    async fn read_credentials(&self, _namespace: &str, secret: &str) -> Result<Credentials> {
        self.state()
            .credentials
            .clone()
            .ok_or_else(|| Error::NotFound(format!("secret {}", secret)))
    }
}

struct MockSession {
    version: String,
}

#[async_trait]
impl MemberSession for MockSession {
    async fn ping(&self) -> std::result::Result<(), MongoError> {
        Ok(())
    }

    async fn build_info(&self) -> std::result::Result<BuildInfo, MongoError> {
        Ok(BuildInfo {
            version: self.version.clone(),
        })
    }
}

#[async_trait]
impl MemberConnector for MockWorld {
    async fn connect(
        &self,
        info: &DialInfo,
    ) -> std::result::Result<Box<dyn MemberSession>, MongoError> {
        let mut state = self.state();
        state.dials.push(info.clone());
        let reachable = info.addresses.iter().any(|a| !state.down.contains(a));
        if !reachable {
            return Err(MongoError::Connection("connection refused".to_string()));
        }
        if let Some(replset) = &info.replset
            && !state.initiated.contains(replset)
        {
            return Err(MongoError::Connection(format!(
                "no primary for replica set {}",
                replset
            )));
        }
        Ok(Box::new(MockSession {
            version: MONGO_VERSION.to_string(),
        }))
    }
}

/// Config with a short quiescence window for tests that need the bootstrap.
pub fn config_with_wait(secs: u64) -> OperatorConfig {
    OperatorConfig {
        replset_init_wait: secs,
        ..Default::default()
    }
}

/// Slightly more than `secs`, for stepping past a quiescence window.
pub fn past(secs: u64) -> Duration {
    Duration::from_secs(secs) + Duration::from_millis(1)
}
