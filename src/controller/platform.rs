//! Platform collaborators.
//!
//! Everything the reconciler needs from the cluster API goes through three
//! narrow traits: [`ObjectStore`] for objects and status, [`PodExecutor`]
//! for running commands inside containers and [`CredentialStore`] for the
//! admin credentials. [`KubePlatform`] implements all of them on a
//! `kube::Client`; the functional tests use an in-memory implementation.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

use crate::client::Credentials;
use crate::controller::context::{FIELD_MANAGER, FINALIZER};
use crate::controller::error::{Error, Result};
use crate::crd::{MongoDbCluster, MongoDbClusterStatus};
use crate::resources::LabelSet;
use crate::resources::statefulset::{ADMIN_PASSWORD_KEY, ADMIN_USER_KEY};

/// Result of a create-if-absent call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Object store operations used by the reconciler.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a StatefulSet; `None` when it does not exist.
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>>;

    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<CreateOutcome>;

    /// Replace a StatefulSet. The object's resourceVersion guards the write:
    /// a concurrent change surfaces as [`Error::Conflict`].
    async fn replace_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet>;

    /// List pods matching a selector, in the order the API returns them.
    async fn list_pods(&self, namespace: &str, selector: &LabelSet) -> Result<Vec<Pod>>;

    async fn create_service(&self, service: &Service) -> Result<CreateOutcome>;

    /// Put the operator's finalizer on a cluster.
    async fn add_cluster_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Drop the operator's finalizer so the API server can finish deleting
    /// the cluster. A cluster that is already gone is not an error.
    async fn remove_cluster_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Persist the whole status of a cluster.
    ///
    /// When `resource_version` is set the write only succeeds against that
    /// version. Returns the resourceVersion after the write.
    async fn replace_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &MongoDbClusterStatus,
    ) -> Result<Option<String>>;
}

/// Runs commands inside pod containers.
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run `command` in `container` of `pod`. Succeeds only if the command
    /// exits successfully.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<()>;
}

/// Reads admin credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read the admin credentials from a secret. [`Error::NotFound`] when the
    /// secret or one of its keys is missing.
    async fn read_credentials(&self, namespace: &str, secret: &str) -> Result<Credentials>;
}

/// Platform implementation backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespace_of<K: ResourceExt>(obj: &K) -> Result<String> {
        obj.namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))
    }
}

fn api_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

fn map_create(result: std::result::Result<(), kube::Error>) -> Result<CreateOutcome> {
    match result {
        Ok(()) => Ok(CreateOutcome::Created),
        Err(e) if api_code(&e) == Some(409) => Ok(CreateOutcome::AlreadyExists),
        Err(e) => Err(Error::Kube(e)),
    }
}

fn map_update(what: String, e: kube::Error) -> Error {
    match api_code(&e) {
        Some(409) => Error::Conflict(what),
        Some(404) => Error::NotFound(what),
        _ => Error::Kube(e),
    }
}

#[async_trait]
impl ObjectStore for KubePlatform {
    async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    #[instrument(skip_all, fields(name = %statefulset.name_any()))]
    async fn create_statefulset(&self, statefulset: &StatefulSet) -> Result<CreateOutcome> {
        let api: Api<StatefulSet> =
            Api::namespaced(self.client.clone(), &Self::namespace_of(statefulset)?);
        let result = api
            .create(&PostParams::default(), statefulset)
            .await
            .map(|_| ());
        map_create(result)
    }

    #[instrument(skip_all, fields(name = %statefulset.name_any()))]
    async fn replace_statefulset(&self, statefulset: &StatefulSet) -> Result<StatefulSet> {
        let name = statefulset.name_any();
        let api: Api<StatefulSet> =
            Api::namespaced(self.client.clone(), &Self::namespace_of(statefulset)?);
        api.replace(&name, &PostParams::default(), statefulset)
            .await
            .map_err(|e| map_update(format!("statefulset {}", name), e))
    }

    async fn list_pods(&self, namespace: &str, selector: &LabelSet) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&selector.to_selector()))
            .await?;
        Ok(pods.items)
    }

    #[instrument(skip_all, fields(name = %service.name_any()))]
    async fn create_service(&self, service: &Service) -> Result<CreateOutcome> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &Self::namespace_of(service)?);
        let result = api
            .create(&PostParams::default(), service)
            .await
            .map(|_| ());
        map_create(result)
    }

    #[instrument(skip(self))]
    async fn add_cluster_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<MongoDbCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": [FINALIZER]
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_update(format!("mongodbcluster {}", name), e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_cluster_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<MongoDbCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": null
            }
        });
        match api
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }

    #[instrument(skip(self, status))]
    async fn replace_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<&str>,
        status: &MongoDbClusterStatus,
    ) -> Result<Option<String>> {
        let api: Api<MongoDbCluster> = Api::namespaced(self.client.clone(), namespace);

        // Lists in a merge patch replace the stored ones, so this writes the
        // status as a whole. A resourceVersion in the patch makes the server
        // reject the write if the object moved on.
        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        let updated = api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_update(format!("mongodbcluster {} status", name), e))?;
        debug!("Persisted cluster status");
        Ok(updated.resource_version())
    }
}

#[async_trait]
impl PodExecutor for KubePlatform {
    #[instrument(skip(self, command), fields(command = ?command))]
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let attach_params = AttachParams {
            container: Some(container.to_string()),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let exec_error = |message: String| Error::Exec {
            pod: pod.to_string(),
            message,
        };

        let mut attached = api.exec(pod, command, &attach_params).await?;

        let mut stdout_output = String::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout
                .read_to_string(&mut stdout_output)
                .await
                .map_err(|e| exec_error(e.to_string()))?;
        }
        let mut stderr_output = String::new();
        if let Some(mut stderr) = attached.stderr() {
            stderr
                .read_to_string(&mut stderr_output)
                .await
                .map_err(|e| exec_error(e.to_string()))?;
        }

        let status = attached
            .take_status()
            .ok_or_else(|| exec_error("failed to get status from exec".to_string()))?;

        match status.await {
            Some(status) if status.status.as_deref() == Some("Success") => {
                debug!(stdout = %stdout_output.trim(), "Exec succeeded");
                Ok(())
            }
            other => {
                let message = if stderr_output.trim().is_empty() {
                    format!("command failed with status: {:?}", other)
                } else {
                    stderr_output.trim().to_string()
                };
                Err(exec_error(message))
            }
        }
    }
}

#[async_trait]
impl CredentialStore for KubePlatform {
    async fn read_credentials(&self, namespace: &str, secret: &str) -> Result<Credentials> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret_obj = api
            .get_opt(secret)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {}", secret)))?;
        credentials_from_secret(secret, &secret_obj)
    }
}

/// Extract admin credentials from a users secret.
pub fn credentials_from_secret(name: &str, secret: &Secret) -> Result<Credentials> {
    let value = |key: &str| -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .ok_or_else(|| Error::NotFound(format!("key {} in secret {}", key, name)))?;
        String::from_utf8(bytes.0.clone())
            .map_err(|e| Error::Validation(format!("Invalid {} encoding: {}", key, e)))
    };

    Ok(Credentials {
        username: value(ADMIN_USER_KEY)?,
        password: value(ADMIN_PASSWORD_KEY)?,
    })
}
