//! Restart orchestration after the serving certificate rotates
//!
//! Pods only read their serving certificate at startup, so after the
//! reserved Secret is updated every replica is deleted and recreated by its
//! owning workload. Siblings go first and the pod running this pass goes
//! last: deleting self first would abandon the remaining siblings.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use certloop_common::metrics::record_termination;
use certloop_common::Error;

use crate::config::InstanceIdentity;

/// Trait abstracting the pod operations restart orchestration needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Fetch a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// List pods in `namespace` carrying all of `labels`
    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error>;

    /// Delete a pod; deleting a pod that is already gone succeeds
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes implementation of [`PodClient`]
pub struct KubePodClient {
    client: Client,
}

impl KubePodClient {
    /// Create a pod client backed by the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PodClient for KubePodClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        match self.api(namespace).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::restart(format!("{}/{}", namespace, name), e.to_string())),
        }
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::restart(format!("{}/{}", namespace, name), e.to_string())),
        }
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// What a restart attempt did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReport {
    /// No pod was touched
    Skipped {
        /// Why orchestration did not run
        reason: String,
    },
    /// Deletions were attempted, siblings first and self last
    Completed {
        /// Pods deleted, in the order they were deleted
        terminated: Vec<String>,
        /// Pods whose deletion failed
        failed: Vec<String>,
    },
}

impl RestartReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Deletes the operator's pods so they reload a rotated certificate
pub struct RestartOrchestrator {
    pods: Arc<dyn PodClient>,
    identity: Option<InstanceIdentity>,
}

impl RestartOrchestrator {
    /// Create an orchestrator for the pod identified by `identity`
    ///
    /// `None` means the process is not running as a pod, and every restart
    /// is skipped.
    pub fn new(pods: Arc<dyn PodClient>, identity: Option<InstanceIdentity>) -> Self {
        Self { pods, identity }
    }

    /// Delete every sibling of the self pod, then the self pod
    ///
    /// Never fails: deletion errors are logged and reported.
    pub async fn restart(&self) -> RestartReport {
        let Some(identity) = &self.identity else {
            info!("no pod identity configured, skipping restart");
            return RestartReport::skipped("no pod identity configured");
        };
        let namespace = identity.namespace.as_str();

        let self_pod = match self.pods.get_pod(namespace, &identity.pod_name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                info!(pod = %identity.pod_name, "self pod not found, skipping restart");
                return RestartReport::skipped(format!("pod {} not found", identity.pod_name));
            }
            Err(e) => {
                warn!(
                    pod = %identity.pod_name,
                    error = %e,
                    "failed to resolve self pod, skipping restart"
                );
                return RestartReport::skipped(e.to_string());
            }
        };

        let labels = self_pod.labels().clone();
        let siblings = if labels.is_empty() {
            Vec::new()
        } else {
            match self.pods.list_pods(namespace, &labels).await {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(error = %e, "failed to list sibling pods, skipping restart");
                    return RestartReport::skipped(e.to_string());
                }
            }
        };

        let mut terminated = Vec::new();
        let mut failed = Vec::new();

        for name in siblings
            .iter()
            .map(|pod| pod.name_any())
            .filter(|name| *name != identity.pod_name)
        {
            self.terminate(namespace, name, "sibling", &mut terminated, &mut failed)
                .await;
        }

        self.terminate(
            namespace,
            identity.pod_name.clone(),
            "self",
            &mut terminated,
            &mut failed,
        )
        .await;

        info!(
            terminated = terminated.len(),
            failed = failed.len(),
            "restart orchestration finished"
        );
        RestartReport::Completed { terminated, failed }
    }

    async fn terminate(
        &self,
        namespace: &str,
        name: String,
        role: &'static str,
        terminated: &mut Vec<String>,
        failed: &mut Vec<String>,
    ) {
        match self.pods.delete_pod(namespace, &name).await {
            Ok(()) => {
                info!(pod = %name, role, "deleted pod");
                record_termination(role, true);
                terminated.push(name);
            }
            Err(e) => {
                warn!(pod = %name, role, error = %e, "failed to delete pod");
                record_termination(role, false);
                failed.push(name);
            }
        }
    }
}
