//! StatefulSet generation for MongoDB replica sets.
//!
//! Creates one StatefulSet per replica set:
//! - Stable network identity via the replica set's headless service
//! - One ReadWriteOnce data volume per member
//! - Internal keyfile mounted from a secret
//! - Soft pod anti-affinity so members prefer distinct hosts

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector, SecretVolumeSource,
    SecurityContext, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::Platform;
use crate::controller::error::{Error, Result};
use crate::crd::{MongoDbCluster, ReplsetSpec};
use crate::resources::common::{
    cluster_namespace, key_secret_name, owner_reference, replset_labels, replset_resource_name,
    standard_labels, users_secret_name,
};
use crate::resources::quantity::{self, MEMORY, ParsedQuantity, STORAGE};

/// Name of the mongod container; the bootstrap command runs here.
pub const MONGOD_CONTAINER_NAME: &str = "mongod";
/// Name of the data volume claim template.
pub const DATA_VOLUME_NAME: &str = "mongod-data";
/// Where mongod keeps its data files.
pub const DATA_MOUNT_PATH: &str = "/data/db";
/// Where the keyfile secret is mounted.
pub const SECRETS_MOUNT_PATH: &str = "/etc/mongodb-secrets";
/// Key inside the keyfile secret.
pub const KEYFILE_KEY: &str = "mongodb-key";
/// Secret keys holding the cluster admin credentials.
pub const ADMIN_USER_KEY: &str = "MONGODB_CLUSTER_ADMIN_USER";
pub const ADMIN_PASSWORD_KEY: &str = "MONGODB_CLUSTER_ADMIN_PASSWORD";

/// Group id of the mongod user in the Percona image.
const MONGOD_GROUP_ID: i64 = 1001;
/// Keyfile must not be world readable.
const SECRET_FILE_MODE: i32 = 0o060;
/// Anti-affinity preference weight.
const ANTI_AFFINITY_WEIGHT: i32 = 100;
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";
/// Memory held back from the WiredTiger cache.
const CACHE_RESERVED_BYTES: f64 = 1024.0 * 1024.0 * 1024.0;
const MIN_CACHE_SIZE_GB: f64 = 0.25;

/// What the platform we run on supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformFacts {
    /// Whether pods may request an fsGroup (OpenShift assigns its own).
    pub fs_group_supported: bool,
}

impl From<Platform> for PlatformFacts {
    fn from(platform: Platform) -> Self {
        Self {
            fs_group_supported: platform == Platform::Kubernetes,
        }
    }
}

/// The target state of one replica set's workload.
///
/// `replicas`, `image`, `resources` and `args` are the fields the operator
/// keeps converged on the live object; `statefulset` is what gets created
/// when no live object exists yet.
#[derive(Clone, Debug)]
pub struct DesiredWorkload {
    pub name: String,
    pub replicas: i32,
    pub image: String,
    pub resources: ResourceRequirements,
    pub args: Vec<String>,
    pub statefulset: StatefulSet,
}

/// Build the desired workload for a replica set.
///
/// Fails with a configuration error when a declared quantity does not parse.
pub fn build_desired_workload(
    cluster: &MongoDbCluster,
    replset: &ReplsetSpec,
    facts: PlatformFacts,
) -> Result<DesiredWorkload> {
    let resources = quantity::resource_requirements(&replset.resources)?;
    let args = mongod_args(cluster, replset, &resources)?;
    let image = image_name(cluster);
    let name = replset_resource_name(cluster, replset);

    let fs_group = facts.fs_group_supported.then_some(MONGOD_GROUP_ID);
    let container = generate_mongod_container(cluster, &image, &args, &resources, fs_group);
    let pvc = generate_pvc_template(replset, &resources)?;

    let statefulset = StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(cluster_namespace(cluster)),
            labels: Some(standard_labels(cluster, replset).into_map()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replset.size),
            service_name: Some(name.clone()),
            selector: replset_labels(cluster, replset).to_label_selector(),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(cluster, replset).into_map()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(generate_affinity(cluster, replset)),
                    restart_policy: Some("Always".to_string()),
                    containers: vec![container],
                    security_context: Some(PodSecurityContext {
                        fs_group,
                        ..Default::default()
                    }),
                    volumes: Some(vec![generate_keyfile_volume(cluster)]),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(DesiredWorkload {
        name,
        replicas: replset.size,
        image,
        resources,
        args,
        statefulset,
    })
}

/// Container image for the cluster's MongoDB version.
pub fn image_name(cluster: &MongoDbCluster) -> String {
    format!("{}:{}", cluster.spec.image.repository, cluster.spec.version)
}

/// Compute the mongod launch arguments.
///
/// Deterministic for a given spec: the differ compares them element by element.
pub fn mongod_args(
    cluster: &MongoDbCluster,
    replset: &ReplsetSpec,
    resources: &ResourceRequirements,
) -> Result<Vec<String>> {
    let mongod = &cluster.spec.mongod;
    let mut args = vec![
        "--bind_ip_all".to_string(),
        "--auth".to_string(),
        format!("--dbpath={}", DATA_MOUNT_PATH),
        format!("--port={}", mongod.port),
        format!("--replSet={}", replset.name),
        format!("--storageEngine={}", mongod.storage_engine),
        format!("--keyFile={}/{}", SECRETS_MOUNT_PATH, KEYFILE_KEY),
    ];

    if mongod.storage_engine == "wiredTiger" {
        let memory_limit = resources.limits.as_ref().and_then(|l| l.get(MEMORY));
        if let Some(limit) = memory_limit {
            let bytes = ParsedQuantity::parse(&limit.0)?.as_f64();
            args.push(format!(
                "--wiredTigerCacheSizeGB={:.2}",
                wired_tiger_cache_size_gb(bytes, mongod.wired_tiger_cache_ratio)
            ));
        }
    }

    Ok(args)
}

/// WiredTiger cache size in GB for a memory limit in bytes.
pub fn wired_tiger_cache_size_gb(limit_bytes: f64, ratio: f64) -> f64 {
    let size = (limit_bytes - CACHE_RESERVED_BYTES) * ratio / (1024.0 * 1024.0 * 1024.0);
    size.max(MIN_CACHE_SIZE_GB)
}

/// Soft anti-affinity: members of one replica set prefer distinct hosts but
/// can still be co-scheduled under resource pressure.
fn generate_affinity(cluster: &MongoDbCluster, replset: &ReplsetSpec) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: ANTI_AFFINITY_WEIGHT,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(replset_labels(cluster, replset).to_label_selector()),
                        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_mongod_container(
    cluster: &MongoDbCluster,
    image: &str,
    args: &[String],
    resources: &ResourceRequirements,
    fs_group: Option<i64>,
) -> Container {
    let port = cluster.spec.mongod.port;
    let users_secret = users_secret_name(cluster);

    Container {
        name: MONGOD_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(cluster.spec.image.pull_policy.clone()),
        args: Some(args.to_vec()),
        ports: Some(vec![ContainerPort {
            name: Some("mongodb".to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            secret_env(ADMIN_USER_KEY, &users_secret),
            secret_env(ADMIN_PASSWORD_KEY, &users_secret),
            EnvVar {
                name: "MONGODB_PORT".to_string(),
                value: Some(port.to_string()),
                ..Default::default()
            },
        ]),
        resources: Some(resources.clone()),
        readiness_probe: Some(tcp_probe(port, 10, 3)),
        liveness_probe: Some(tcp_probe(port, 60, 5)),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: fs_group,
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: key_secret_name(cluster),
                mount_path: SECRETS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn secret_env(key: &str, secret: &str) -> EnvVar {
    EnvVar {
        name: key.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tcp_probe(port: i32, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        timeout_seconds: Some(2),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

fn generate_keyfile_volume(cluster: &MongoDbCluster) -> Volume {
    let name = key_secret_name(cluster);
    Volume {
        name: name.clone(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(name),
            default_mode: Some(SECRET_FILE_MODE),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// One ReadWriteOnce volume per member, sized from the storage limit.
fn generate_pvc_template(
    replset: &ReplsetSpec,
    resources: &ResourceRequirements,
) -> Result<PersistentVolumeClaim> {
    let size = resources
        .limits
        .as_ref()
        .and_then(|l| l.get(STORAGE))
        .cloned()
        .ok_or_else(|| Error::Config(format!("replset {} has no storage size", replset.name)))?;

    let mut requests: BTreeMap<String, Quantity> = BTreeMap::new();
    requests.insert(STORAGE.to_string(), size);

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: replset.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}
