//! Service generation for MongoDB replica sets.
//!
//! Each replica set gets a headless Service named after its StatefulSet, which
//! gives every member a stable DNS name:
//! `{pod}.{cluster}-{replset}.{namespace}.svc.cluster.local`.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{MongoDbCluster, ReplsetSpec};
use crate::resources::common::{
    cluster_namespace, owner_reference, replset_labels, replset_resource_name, standard_labels,
};

/// Generate the headless Service for a replica set.
///
/// `publishNotReadyAddresses` is set so members resolve each other before
/// they pass readiness, which the replica set bootstrap depends on.
pub fn generate_headless_service(cluster: &MongoDbCluster, replset: &ReplsetSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(replset_resource_name(cluster, replset)),
            namespace: Some(cluster_namespace(cluster)),
            labels: Some(standard_labels(cluster, replset).into_map()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(replset_labels(cluster, replset).into_map()),
            ports: Some(vec![ServicePort {
                port: cluster.spec.mongod.port,
                target_port: Some(IntOrString::String("mongodb".to_string())),
                name: Some("mongodb".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
