//! Controller module for mongodb-operator.
//!
//! Contains the reconciliation loop for MongoDbCluster and the pieces it is
//! built from: workload diffing, member probes, status aggregation and the
//! one-time replica set bootstrap.

pub mod cluster_reconciler;
pub mod cluster_validation;
pub mod context;
pub mod error;
pub mod platform;
pub mod replset_init;
pub mod replset_reconciler;
pub mod state_diff;
pub mod status;
pub mod topology_probe;
pub mod watchdog;
