//! Resource generation module.
//!
//! Contains utilities for generating Kubernetes resources owned by MongoDbCluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | Stable pod identity and storage for replica set members |
//! | Headless Service | Member DNS (publishNotReadyAddresses) |

pub mod common;
pub mod quantity;
pub mod services;
pub mod statefulset;

pub use common::{LabelSet, owner_reference, standard_labels};
pub use statefulset::{DesiredWorkload, PlatformFacts, build_desired_workload};
