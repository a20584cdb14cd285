//! Direct probes of replica set members.
//!
//! Both probes are read-only: they run `ping` and `buildInfo` and never touch
//! the replication configuration. A member that cannot be reached is an
//! unknown, not an error.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::client::{Credentials, DialInfo, MemberConnector, MongoError};
use crate::crd::{MemberStatus, ReplsetStatus};

/// Upper bound on concurrent member probes during a refresh.
pub const DEFAULT_PROBE_CONCURRENCY: usize = 4;

/// Result of refreshing member status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberRefresh {
    /// Members that answered, in input order.
    pub members: Vec<MemberStatus>,
    /// Addresses that could not be probed.
    pub unreachable: Vec<String>,
}

/// Probes members through a [`MemberConnector`].
pub struct TopologyProber<'a> {
    connector: &'a dyn MemberConnector,
    credentials: Option<Credentials>,
    timeout: Duration,
    concurrency: usize,
}

impl<'a> TopologyProber<'a> {
    pub fn new(
        connector: &'a dyn MemberConnector,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            credentials,
            timeout,
            concurrency: DEFAULT_PROBE_CONCURRENCY,
        }
    }

    /// Limit concurrent probes. Results do not depend on this.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Whether the replica set has been initiated.
    ///
    /// Short-circuits on the persisted flag. Otherwise dials all members as a
    /// replica set; a successful ping means a primary answered under the
    /// replica set name, which only happens after initiation, and the flag is
    /// set on `status`. Any failure leaves the flag alone and returns false.
    pub async fn check_initialized(
        &self,
        status: &mut ReplsetStatus,
        replset: &str,
        addresses: &[String],
    ) -> bool {
        if status.initialized {
            return true;
        }
        if addresses.is_empty() {
            return false;
        }

        let info = DialInfo::replset(addresses.to_vec(), replset)
            .with_credentials(self.credentials.clone())
            .with_timeout(self.timeout);

        match self.ping(&info).await {
            Ok(()) => {
                info!(replset = %replset, "Replica set already initialized");
                status.mark_initialized();
                true
            }
            Err(e) => {
                debug!(replset = %replset, error = %e, "Replica set not reachable as a set");
                false
            }
        }
    }

    /// Probe each member directly and collect the ones that answer.
    ///
    /// Members that fail are skipped; the output keeps the input order.
    pub async fn refresh_members(&self, addresses: &[String]) -> MemberRefresh {
        let results: Vec<(String, Result<String, MongoError>)> = stream::iter(addresses.to_vec())
            .map(|address: String| async move {
                let version = self.member_version(&address).await;
                (address, version)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut refresh = MemberRefresh::default();
        for (address, result) in results {
            match result {
                Ok(version) => refresh.members.push(MemberStatus {
                    name: address,
                    version,
                }),
                Err(e) => {
                    debug!(member = %address, error = %e, "Member probe failed");
                    refresh.unreachable.push(address);
                }
            }
        }
        refresh
    }

    async fn ping(&self, info: &DialInfo) -> Result<(), MongoError> {
        let session = self.connector.connect(info).await?;
        session.ping().await
    }

    async fn member_version(&self, address: &str) -> Result<String, MongoError> {
        let info = DialInfo::direct(address)
            .with_credentials(self.credentials.clone())
            .with_timeout(self.timeout);
        let session = self.connector.connect(&info).await?;
        Ok(session.build_info().await?.version)
    }
}
