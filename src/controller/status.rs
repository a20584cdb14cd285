//! Status management.
//!
//! [`StatusAggregator`] owns the working copy of a cluster's status for one
//! reconciliation. Replica set entries are updated in place and the status
//! is written back as a whole, and only when something actually changed.

use kube::ResourceExt;
use tracing::debug;

use crate::controller::error::Result;
use crate::controller::platform::ObjectStore;
use crate::crd::{Condition, MemberStatus, MongoDbCluster, MongoDbClusterStatus, ReplsetStatus};
use crate::resources::common::cluster_namespace;

/// Working copy of a cluster status with change tracking.
#[derive(Clone, Debug)]
pub struct StatusAggregator {
    namespace: String,
    name: String,
    resource_version: Option<String>,
    status: MongoDbClusterStatus,
    dirty: bool,
}

impl StatusAggregator {
    /// Start from the status stored on `cluster` (empty when there is none).
    pub fn new(cluster: &MongoDbCluster) -> Self {
        Self {
            namespace: cluster_namespace(cluster),
            name: cluster.name_any(),
            resource_version: cluster.resource_version(),
            status: cluster.status.clone().unwrap_or_default(),
            dirty: false,
        }
    }

    pub fn status(&self) -> &MongoDbClusterStatus {
        &self.status
    }

    pub fn replset(&self, name: &str) -> Option<&ReplsetStatus> {
        self.status.replset(name)
    }

    /// Look up a replica set entry by name, creating it on first use.
    ///
    /// A freshly created entry makes the status dirty so it gets persisted.
    pub fn replset_mut(&mut self, name: &str) -> &mut ReplsetStatus {
        if self.status.replset(name).is_none() {
            self.dirty = true;
        }
        self.status.replset_mut(name)
    }

    /// Whether the replica set is marked initialized.
    pub fn is_initialized(&self, name: &str) -> bool {
        self.status.replset(name).is_some_and(|rs| rs.initialized)
    }

    /// Replace the pod list and member list of a replica set if either differs
    /// from what is stored. Returns whether anything changed.
    pub fn aggregate(&mut self, name: &str, pods: &[String], members: &[MemberStatus]) -> bool {
        let entry = self.replset_mut(name);
        let mut changed = false;
        if entry.pods != pods {
            entry.pods = pods.to_vec();
            changed = true;
        }
        if entry.members != members {
            entry.members = members.to_vec();
            changed = true;
        }
        if changed {
            debug!(replset = %name, pods = pods.len(), members = members.len(), "Replset status changed");
            self.dirty = true;
        }
        changed
    }

    /// Mark a replica set initialized. Returns true if it was not already.
    pub fn mark_initialized(&mut self, name: &str) -> bool {
        let entry = self.replset_mut(name);
        if entry.initialized {
            return false;
        }
        entry.mark_initialized();
        self.dirty = true;
        true
    }

    /// Mark dirty after an entry was changed through [`Self::replset_mut`].
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    /// Set a condition. Keeps the stored transition time when only the
    /// message changed, and stays clean when nothing changed at all.
    pub fn set_condition(&mut self, condition: Condition) {
        let conditions = &mut self.status.conditions;
        match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(existing) if existing.same_state(&condition) => {
                if existing.message != condition.message
                    || existing.observed_generation != condition.observed_generation
                {
                    existing.message = condition.message;
                    existing.observed_generation = condition.observed_generation;
                    self.dirty = true;
                }
            }
            Some(existing) => {
                *existing = condition;
                self.dirty = true;
            }
            None => {
                conditions.push(condition);
                self.dirty = true;
            }
        }
    }

    pub fn set_observed_generation(&mut self, generation: Option<i64>) {
        if self.status.observed_generation != generation {
            self.status.observed_generation = generation;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the status back if dirty. Returns whether a write happened.
    pub async fn persist(&mut self, store: &dyn ObjectStore) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let version = store
            .replace_cluster_status(
                &self.namespace,
                &self.name,
                self.resource_version.as_deref(),
                &self.status,
            )
            .await?;
        if version.is_some() {
            self.resource_version = version;
        }
        self.dirty = false;
        Ok(true)
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Get the reason for a condition
pub fn get_condition_reason<'a>(
    conditions: &'a [Condition],
    condition_type: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.reason.as_str())
}
