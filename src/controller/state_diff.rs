//! Live-vs-desired workload comparison.
//!
//! Only the fields the operator owns after creation are converged: replica
//! count, image, cpu/memory requests and limits, and the mongod arguments.
//! Everything else on the live object, storage limit included, is left as
//! the platform stored it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::platform::ObjectStore;
use crate::resources::quantity::{self, CPU, MEMORY};
use crate::resources::statefulset::{DesiredWorkload, MONGOD_CONTAINER_NAME};

/// A field the differ rewrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldChange {
    Replicas,
    Image,
    Request(&'static str),
    Limit(&'static str),
    Args,
}

impl std::fmt::Display for FieldChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldChange::Replicas => write!(f, "replicas"),
            FieldChange::Image => write!(f, "image"),
            FieldChange::Request(r) => write!(f, "requests.{}", r),
            FieldChange::Limit(r) => write!(f, "limits.{}", r),
            FieldChange::Args => write!(f, "args"),
        }
    }
}

/// Outcome of a diff: the fields that were rewritten on the live object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadDiff {
    pub changes: Vec<FieldChange>,
}

impl WorkloadDiff {
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Rewrite `live` in place so the owned fields match `desired`.
///
/// Each field is checked independently. A desired cpu/memory limit is only
/// applied when it differs from the live limit and is not below the request
/// for that resource (after the request itself was updated); otherwise the
/// live limit is kept so the object stays valid. An absent quantity counts
/// as zero, so dropping a limit only goes through when there is no request.
pub fn diff_workload(live: &mut StatefulSet, desired: &DesiredWorkload) -> Result<WorkloadDiff> {
    let name = live.name_any();
    let mut diff = WorkloadDiff::default();

    let spec = live
        .spec
        .as_mut()
        .ok_or_else(|| Error::MissingField(format!("statefulset {} spec", name)))?;

    if spec.replicas != Some(desired.replicas) {
        spec.replicas = Some(desired.replicas);
        diff.changes.push(FieldChange::Replicas);
    }

    let container = mongod_container(spec.template.spec.as_mut().map(|p| &mut p.containers))
        .ok_or_else(|| Error::MissingField(format!("statefulset {} mongod container", name)))?;

    if container.image.as_deref() != Some(desired.image.as_str()) {
        container.image = Some(desired.image.clone());
        diff.changes.push(FieldChange::Image);
    }

    let resources = container.resources.get_or_insert_with(ResourceRequirements::default);
    for resource in [CPU, MEMORY] {
        if sync_request(resources, &desired.resources, resource)? {
            diff.changes.push(FieldChange::Request(resource));
        }
        if sync_limit(resources, &desired.resources, resource)? {
            diff.changes.push(FieldChange::Limit(resource));
        }
    }

    if !args_equal(container.args.as_deref().unwrap_or_default(), &desired.args) {
        container.args = Some(desired.args.clone());
        diff.changes.push(FieldChange::Args);
    }

    Ok(diff)
}

/// Diff `live` against `desired` and write it back if anything changed.
///
/// Returns whether a write happened. A write failure is returned as is; the
/// next pass retries from a fresh read.
pub async fn apply_workload_diff(
    store: &dyn ObjectStore,
    mut live: StatefulSet,
    desired: &DesiredWorkload,
) -> Result<bool> {
    let diff = diff_workload(&mut live, desired)?;
    if !diff.changed() {
        debug!(statefulset = %desired.name, "StatefulSet up to date");
        return Ok(false);
    }

    let changes: Vec<String> = diff.changes.iter().map(ToString::to_string).collect();
    info!(statefulset = %desired.name, changes = ?changes, "Updating StatefulSet");
    store.replace_statefulset(&live).await?;
    Ok(true)
}

fn mongod_container(containers: Option<&mut Vec<Container>>) -> Option<&mut Container> {
    let containers = containers?;
    let idx = containers
        .iter()
        .position(|c| c.name == MONGOD_CONTAINER_NAME)
        .unwrap_or(0);
    containers.get_mut(idx)
}

/// Order-sensitive element comparison.
pub fn args_equal(live: &[String], desired: &[String]) -> bool {
    live.len() == desired.len() && live.iter().zip(desired).all(|(a, b)| a == b)
}

fn sync_request(
    live: &mut ResourceRequirements,
    desired: &ResourceRequirements,
    resource: &str,
) -> Result<bool> {
    let wanted = desired.requests.as_ref().and_then(|r| r.get(resource));
    let current = live.requests.as_ref().and_then(|r| r.get(resource));
    if quantity::compare(current, wanted)? == Ordering::Equal && current.is_some() == wanted.is_some()
    {
        return Ok(false);
    }
    set_quantity(&mut live.requests, resource, wanted.cloned());
    Ok(true)
}

fn sync_limit(
    live: &mut ResourceRequirements,
    desired: &ResourceRequirements,
    resource: &str,
) -> Result<bool> {
    let wanted = desired.limits.as_ref().and_then(|l| l.get(resource));
    let current = live.limits.as_ref().and_then(|l| l.get(resource));

    match (wanted, current) {
        (None, None) => return Ok(false),
        (Some(w), Some(c)) if quantity::compare(Some(w), Some(c))? == Ordering::Equal => {
            return Ok(false);
        }
        _ => {}
    }

    // Absent quantities count as zero on both sides
    let request = live.requests.as_ref().and_then(|r| r.get(resource));
    if quantity::compare(wanted, request)? == Ordering::Less {
        debug!(
            resource = %resource,
            limit = ?wanted.map(|q| &q.0),
            request = ?request.map(|q| &q.0),
            "Keeping current limit: desired limit is below request"
        );
        return Ok(false);
    }

    set_quantity(&mut live.limits, resource, wanted.cloned());
    Ok(true)
}

fn set_quantity(
    map: &mut Option<BTreeMap<String, Quantity>>,
    resource: &str,
    value: Option<Quantity>,
) {
    match value {
        Some(q) => {
            map.get_or_insert_with(BTreeMap::new)
                .insert(resource.to_string(), q);
        }
        None => {
            if let Some(m) = map.as_mut() {
                m.remove(resource);
            }
        }
    }
}
