//! Common resource generation utilities.
//!
//! Provides labels, selectors, owner references and naming shared by every
//! object generated for a replica set.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::ResourceExt;

use crate::crd::{MongoDbCluster, ReplsetSpec};

/// Operator name, used for the managed-by label and as field manager.
pub const OPERATOR_NAME: &str = "mongodb-operator";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_REPLSET: &str = "app.kubernetes.io/replset";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// A typed set of label key/value pairs.
///
/// Keys are kept ordered, so two sets with the same pairs compare equal
/// regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, replacing any previous value for the key.
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every pair of this set is present in `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Render as an equality-based label selector (`k1=v1,k2=v2`).
    pub fn to_selector(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Render as a `matchLabels` selector object.
    pub fn to_label_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: Some(self.0.clone()),
            ..Default::default()
        }
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector())
    }
}

impl From<LabelSet> for BTreeMap<String, String> {
    fn from(labels: LabelSet) -> Self {
        labels.0
    }
}

/// Labels selecting the pods of one replica set.
pub fn replset_labels(cluster: &MongoDbCluster, replset: &ReplsetSpec) -> LabelSet {
    LabelSet::new()
        .with(LABEL_NAME, "mongodb")
        .with(LABEL_INSTANCE, &cluster.name_any())
        .with(LABEL_REPLSET, &replset.name)
}

/// Labels applied to generated objects: the selector labels plus managed-by.
pub fn standard_labels(cluster: &MongoDbCluster, replset: &ReplsetSpec) -> LabelSet {
    replset_labels(cluster, replset).with(LABEL_MANAGED_BY, OPERATOR_NAME)
}

/// Create owner reference for a MongoDbCluster
pub fn owner_reference(cluster: &MongoDbCluster) -> OwnerReference {
    OwnerReference {
        api_version: "mongodb.smoketurner.com/v1alpha1".to_string(),
        kind: "MongoDbCluster".to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Name shared by the replica set's StatefulSet and Service.
pub fn replset_resource_name(cluster: &MongoDbCluster, replset: &ReplsetSpec) -> String {
    format!("{}-{}", cluster.name_any(), replset.name)
}

pub fn cluster_namespace(cluster: &MongoDbCluster) -> String {
    cluster.namespace().unwrap_or_else(|| "default".to_string())
}

/// Secret holding the cluster admin credentials.
pub fn users_secret_name(cluster: &MongoDbCluster) -> String {
    cluster
        .spec
        .secrets
        .users
        .clone()
        .unwrap_or_else(|| format!("{}-users", cluster.name_any()))
}

/// Secret holding the replication keyfile.
pub fn key_secret_name(cluster: &MongoDbCluster) -> String {
    cluster
        .spec
        .secrets
        .key
        .clone()
        .unwrap_or_else(|| format!("{}-intrnl-mongodb-key", cluster.name_any()))
}

/// Stable DNS name of a member pod behind the replica set's headless service.
///
/// Format: `{pod}.{cluster}-{replset}.{namespace}.svc.cluster.local`
pub fn member_host(pod_name: &str, cluster: &MongoDbCluster, replset: &ReplsetSpec) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local",
        pod_name,
        replset_resource_name(cluster, replset),
        cluster_namespace(cluster)
    )
}

/// `host:port` address of a member pod.
pub fn member_address(pod_name: &str, cluster: &MongoDbCluster, replset: &ReplsetSpec) -> String {
    format!(
        "{}:{}",
        member_host(pod_name, cluster, replset),
        cluster.spec.mongod.port
    )
}
