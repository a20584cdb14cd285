//! Background member monitor.
//!
//! Once a replica set of a cluster is initialized, a watchdog task is started
//! for that cluster. Between reconciliations it re-probes the members known
//! from the pod cache, logs the ones that stopped answering and keeps the
//! member gauges current. It never changes anything on the cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{Credentials, MemberConnector};
use crate::controller::topology_probe::TopologyProber;
use crate::health::HealthState;

/// Member addresses per replica set, per cluster key (`namespace/cluster`).
///
/// Written by the reconciler after every pod listing, read by watchdogs.
#[derive(Clone, Debug, Default)]
pub struct PodCache {
    inner: Arc<RwLock<HashMap<String, BTreeMap<String, Vec<String>>>>>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(namespace: &str, cluster: &str) -> String {
        format!("{}/{}", namespace, cluster)
    }

    /// Record the current member addresses of a replica set.
    pub fn update(&self, cluster_key: &str, replset: &str, addresses: Vec<String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(cluster_key.to_string())
            .or_default()
            .insert(replset.to_string(), addresses);
    }

    /// Snapshot of all replica sets of a cluster.
    pub fn get(&self, cluster_key: &str) -> BTreeMap<String, Vec<String>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(cluster_key).cloned().unwrap_or_default()
    }

    pub fn remove(&self, cluster_key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(cluster_key);
    }
}

/// What a watchdog task needs.
///
/// `credentials` seeds a running task; later calls to
/// [`WatchdogRegistry::ensure_started`] replace them in place.
#[derive(Clone)]
pub struct WatchdogConfig {
    pub namespace: String,
    pub cluster: String,
    pub interval: Duration,
    pub dial_timeout: Duration,
    pub credentials: Option<Credentials>,
}

struct WatchdogHandle {
    stop: watch::Sender<bool>,
    credentials: watch::Sender<Option<Credentials>>,
    task: JoinHandle<()>,
}

/// Tracks running watchdogs; at most one per cluster key.
#[derive(Clone, Default)]
pub struct WatchdogRegistry {
    running: Arc<Mutex<HashMap<String, WatchdogHandle>>>,
}

impl WatchdogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WatchdogHandle>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a watchdog for `config`'s cluster unless one is already running.
    ///
    /// A running watchdog keeps its task but picks up `config.credentials`
    /// from its next round on. Returns true if a new task was spawned. Must
    /// be called from within a Tokio runtime.
    pub fn ensure_started(
        &self,
        config: WatchdogConfig,
        connector: Arc<dyn MemberConnector>,
        pods: PodCache,
        health: Option<Arc<HealthState>>,
    ) -> bool {
        let key = PodCache::key(&config.namespace, &config.cluster);
        let mut running = self.lock();
        if let Some(handle) = running.get(&key).filter(|h| !h.task.is_finished()) {
            let replaced = handle.credentials.send_if_modified(|current| {
                if *current == config.credentials {
                    return false;
                }
                current.clone_from(&config.credentials);
                true
            });
            if replaced {
                info!(cluster = %key, "Watchdog credentials updated");
            }
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let (credentials, credentials_rx) = watch::channel(config.credentials.clone());
        info!(cluster = %key, interval_secs = config.interval.as_secs(), "Starting watchdog");
        let task = tokio::spawn(run_watchdog(
            config,
            connector,
            pods,
            health,
            credentials_rx,
            stop_rx,
        ));
        running.insert(
            key,
            WatchdogHandle {
                stop,
                credentials,
                task,
            },
        );
        true
    }

    /// Stop the watchdog of a cluster. Returns true if one was running.
    pub fn stop(&self, namespace: &str, cluster: &str) -> bool {
        let key = PodCache::key(namespace, cluster);
        match self.lock().remove(&key) {
            Some(handle) => {
                // The task may already be gone; nothing to do then
                let _ = handle.stop.send(true);
                info!(cluster = %key, "Stopped watchdog");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, namespace: &str, cluster: &str) -> bool {
        self.lock()
            .get(&PodCache::key(namespace, cluster))
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Stop every watchdog, used on shutdown.
    pub fn stop_all(&self) {
        for (_, handle) in self.lock().drain() {
            let _ = handle.stop.send(true);
        }
    }
}

async fn run_watchdog(
    config: WatchdogConfig,
    connector: Arc<dyn MemberConnector>,
    pods: PodCache,
    health: Option<Arc<HealthState>>,
    credentials: watch::Receiver<Option<Credentials>>,
    mut stop: watch::Receiver<bool>,
) {
    let key = PodCache::key(&config.namespace, &config.cluster);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!(cluster = %key, "Watchdog exiting");
                    return;
                }
            }
        }

        let current = credentials.borrow().clone();
        let prober = TopologyProber::new(connector.as_ref(), current, config.dial_timeout);
        for (replset, addresses) in pods.get(&key) {
            let refresh = prober.refresh_members(&addresses).await;
            if !refresh.unreachable.is_empty() {
                warn!(
                    cluster = %key,
                    replset = %replset,
                    unreachable = ?refresh.unreachable,
                    "Replica set members not answering"
                );
            }
            if let Some(health) = &health {
                health.metrics.record_member_probe(
                    &config.namespace,
                    &config.cluster,
                    &replset,
                    refresh.members.len(),
                    refresh.unreachable.len(),
                );
            }
        }
    }
}
