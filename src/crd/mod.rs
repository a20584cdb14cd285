//! Custom Resource Definitions (CRDs) for mongodb-operator.
//!
//! - `MongoDbCluster`: a MongoDB deployment made of one or more replica sets

mod mongodb_cluster;

pub use mongodb_cluster::*;
