//! Leader election on a coordination.k8s.io Lease.
//!
//! Only the holder of the lease runs the controller. The holder renews the
//! lease periodically; another instance takes it over once the renew time is
//! older than the lease duration. Every write carries the resourceVersion it
//! was computed from, so two candidates racing for an expired lease cannot
//! both win.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};

/// Identity and timing of a lease candidate.
#[derive(Clone, Debug)]
pub struct LeaseLockParams {
    pub holder_id: String,
    pub lease_name: String,
    pub lease_ttl: Duration,
}

/// Outcome of one acquire-or-renew attempt.
#[derive(Clone, Debug)]
pub struct LeaseLockResult {
    pub acquired_lease: bool,
    pub holder: Option<String>,
}

/// A Lease used as a leader lock.
pub struct LeaseLock {
    api: Api<Lease>,
    params: LeaseLockParams,
}

impl LeaseLock {
    pub fn new(client: Client, namespace: &str, params: LeaseLockParams) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            params,
        }
    }

    /// Take the lease if it is free or expired, renew it if we hold it.
    ///
    /// Losing a write race is not an error: the result just reports that the
    /// lease was not acquired.
    pub async fn try_acquire_or_renew(&self) -> Result<LeaseLockResult> {
        let now = Utc::now();
        let Some(current) = self.api.get_opt(&self.params.lease_name).await? else {
            let lease = new_lease(&self.params, now);
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => {
                    info!(lease = %self.params.lease_name, "Created leader lease");
                    Ok(self.held())
                }
                Err(kube::Error::Api(e)) if e.code == 409 => Ok(self.lost(None)),
                Err(e) => Err(Error::Kube(e)),
            };
        };

        let Some(spec) = claim(current.spec.as_ref(), &self.params, now) else {
            return Ok(self.lost(holder_of(&current)));
        };

        let mut updated = current.clone();
        updated.spec = Some(spec);
        match self
            .api
            .replace(&self.params.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(self.held()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %current.name_any(), "Lost race for leader lease");
                Ok(self.lost(holder_of(&current)))
            }
            Err(e) => Err(Error::Kube(e)),
        }
    }

    fn held(&self) -> LeaseLockResult {
        LeaseLockResult {
            acquired_lease: true,
            holder: Some(self.params.holder_id.clone()),
        }
    }

    fn lost(&self, holder: Option<String>) -> LeaseLockResult {
        LeaseLockResult {
            acquired_lease: false,
            holder,
        }
    }
}

fn holder_of(lease: &Lease) -> Option<String> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.clone())
}

fn ttl_seconds(params: &LeaseLockParams) -> i32 {
    i32::try_from(params.lease_ttl.as_secs()).unwrap_or(i32::MAX)
}

fn new_lease(params: &LeaseLockParams, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(params.lease_name.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(params.holder_id.clone()),
            lease_duration_seconds: Some(ttl_seconds(params)),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(0),
            ..Default::default()
        }),
    }
}

/// Whether the lease ran out at `now`. A lease without renew time or
/// duration has never been held.
pub fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(duration)) => {
            now.signed_duration_since(renewed.0).num_milliseconds() > i64::from(duration) * 1000
        }
        _ => true,
    }
}

/// The spec to write for `params` at `now`, or `None` while someone else
/// holds a live lease.
pub fn claim(
    current: Option<&LeaseSpec>,
    params: &LeaseLockParams,
    now: DateTime<Utc>,
) -> Option<LeaseSpec> {
    let current = current.cloned().unwrap_or_default();
    let ours = current.holder_identity.as_deref() == Some(params.holder_id.as_str());

    if ours {
        return Some(LeaseSpec {
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(ttl_seconds(params)),
            ..current
        });
    }
    if !is_expired(&current, now) {
        return None;
    }
    Some(LeaseSpec {
        holder_identity: Some(params.holder_id.clone()),
        lease_duration_seconds: Some(ttl_seconds(params)),
        acquire_time: Some(MicroTime(now)),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(current.lease_transitions.unwrap_or(0) + 1),
        ..current
    })
}
