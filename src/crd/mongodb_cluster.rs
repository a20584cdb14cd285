//! MongoDbCluster Custom Resource Definition.
//!
//! Declares a MongoDB deployment made of one or more replica sets. Each
//! replica set is materialized as its own StatefulSet and headless Service,
//! and tracks its own initialization state in the cluster status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// MongoDbCluster is a custom resource for deploying MongoDB replica sets.
///
/// Example:
/// ```yaml
/// apiVersion: mongodb.smoketurner.com/v1alpha1
/// kind: MongoDbCluster
/// metadata:
///   name: my-cluster
/// spec:
///   version: "3.6"
///   replsets:
///     - name: rs0
///       size: 3
///       resources:
///         requests: { cpu: 500m, memory: 1Gi }
///         limits: { cpu: "1", memory: 2Gi, storage: 10Gi }
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "mongodb.smoketurner.com",
    version = "v1alpha1",
    kind = "MongoDbCluster",
    plural = "mongodbclusters",
    shortname = "mdb",
    status = "MongoDbClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoDbClusterSpec {
    /// MongoDB server version, used as the image tag (default: 3.6).
    #[serde(default = "default_version")]
    pub version: String,

    /// Container image configuration.
    #[serde(default)]
    pub image: ImageSpec,

    /// mongod process configuration shared by all replica sets.
    #[serde(default)]
    pub mongod: MongodSpec,

    /// Names of the secrets consumed by the cluster.
    #[serde(default)]
    pub secrets: SecretsSpec,

    /// Replica sets making up the cluster.
    #[serde(default)]
    pub replsets: Vec<ReplsetSpec>,
}

impl Default for MongoDbClusterSpec {
    fn default() -> Self {
        Self {
            version: default_version(),
            image: ImageSpec::default(),
            mongod: MongodSpec::default(),
            secrets: SecretsSpec::default(),
            replsets: Vec::new(),
        }
    }
}

fn default_version() -> String {
    "3.6".to_string()
}

/// Container image specification.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Image repository (default: percona/percona-server-mongodb).
    #[serde(default = "default_image_repository")]
    pub repository: String,

    /// Image pull policy (default: IfNotPresent).
    #[serde(default = "default_image_pull_policy")]
    pub pull_policy: String,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            repository: default_image_repository(),
            pull_policy: default_image_pull_policy(),
        }
    }
}

fn default_image_repository() -> String {
    "percona/percona-server-mongodb".to_string()
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// mongod process settings.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MongodSpec {
    /// Port mongod listens on (default: 27017).
    #[serde(default = "default_port")]
    pub port: i32,

    /// Storage engine (default: wiredTiger).
    #[serde(default = "default_storage_engine")]
    pub storage_engine: String,

    /// Fraction of (memory limit - 1GiB) handed to the WiredTiger cache (default: 0.5).
    #[serde(default = "default_cache_ratio")]
    pub wired_tiger_cache_ratio: f64,
}

impl Default for MongodSpec {
    fn default() -> Self {
        Self {
            port: default_port(),
            storage_engine: default_storage_engine(),
            wired_tiger_cache_ratio: default_cache_ratio(),
        }
    }
}

fn default_port() -> i32 {
    27017
}

fn default_storage_engine() -> String {
    "wiredTiger".to_string()
}

fn default_cache_ratio() -> f64 {
    0.5
}

/// Secret names used by the cluster. Empty values fall back to
/// `{cluster}-users` and `{cluster}-intrnl-mongodb-key`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretsSpec {
    /// Secret holding the cluster admin credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,

    /// Secret holding the internal replication keyfile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A single replica set within the cluster.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplsetSpec {
    /// Replica set name, also used as the `--replSet` argument.
    pub name: String,

    /// Desired number of members (default: 3).
    #[serde(default = "default_replset_size")]
    pub size: i32,

    /// Resource requests and limits for each member.
    #[serde(default)]
    pub resources: ReplsetResources,

    /// Storage class for member volumes. Uses the platform default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Overrides the operator-wide wait before the replica set is initiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_wait_seconds: Option<u64>,
}

impl ReplsetSpec {
    /// Create a replset spec with default resources.
    pub fn new(name: &str, size: i32) -> Self {
        Self {
            name: name.to_string(),
            size,
            resources: ReplsetResources::default(),
            storage_class: None,
            init_wait_seconds: None,
        }
    }
}

fn default_replset_size() -> i32 {
    3
}

/// Requests and limits as declared, still unparsed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplsetResources {
    #[serde(default)]
    pub requests: ResourceSpec,

    #[serde(default)]
    pub limits: ResourceLimitsSpec,
}

/// CPU and memory quantities.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// CPU, memory and storage limits.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Size of each member's data volume (default: 10Gi).
    #[serde(default = "default_storage_size")]
    pub storage: String,
}

impl Default for ResourceLimitsSpec {
    fn default() -> Self {
        Self {
            cpu: None,
            memory: None,
            storage: default_storage_size(),
        }
    }
}

fn default_storage_size() -> String {
    "10Gi".to_string()
}

/// Status of a MongoDbCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoDbClusterStatus {
    /// Per replica set status, one entry per replset name.
    #[serde(default)]
    pub replsets: Vec<ReplsetStatus>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MongoDbClusterStatus {
    /// Find the status entry for a replica set.
    pub fn replset(&self, name: &str) -> Option<&ReplsetStatus> {
        self.replsets.iter().find(|rs| rs.name == name)
    }

    /// Find the status entry for a replica set, creating it if absent.
    ///
    /// Lookup is by exact name, so repeated calls never add a second entry.
    pub fn replset_mut(&mut self, name: &str) -> &mut ReplsetStatus {
        let idx = match self.replsets.iter().position(|rs| rs.name == name) {
            Some(idx) => idx,
            None => {
                self.replsets.push(ReplsetStatus::new(name));
                self.replsets.len() - 1
            }
        };
        &mut self.replsets[idx]
    }
}

/// Persisted state of a single replica set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplsetStatus {
    /// Replica set name.
    pub name: String,

    /// Whether the replica set has been initiated. Never reset once true.
    #[serde(default)]
    pub initialized: bool,

    /// Pod names backing the replica set, in listing order.
    #[serde(default)]
    pub pods: Vec<String>,

    /// Members that answered the last probe.
    #[serde(default)]
    pub members: Vec<MemberStatus>,
}

impl ReplsetStatus {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Mark the replica set initialized. There is no way back.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }
}

/// A reachable replica set member.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Member address (host:port).
    pub name: String,

    /// Version reported by buildInfo.
    pub version: String,
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new("Ready", ready, reason, message, generation)
    }

    /// Create a "Progressing" condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new("Progressing", progressing, reason, message, generation)
    }

    /// Same type, status and reason; timestamps are ignored.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type && self.status == other.status && self.reason == other.reason
    }
}
