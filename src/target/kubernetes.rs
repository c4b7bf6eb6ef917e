//! Pod discovery against the in-cluster Kubernetes API.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::operation::Checker;

use super::{
    target_address, Target, TargetSource, APP_LABEL, PATH_LABEL, PORT_LABEL, SCHEME_LABEL,
    SCRAPE_LABEL,
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const RUNNING_PHASE: &str = "Running";

/// Lists scrapable pods from the Kubernetes cluster the process runs in.
///
/// Pods are selected by the labels `autopgo.scrape=true` and
/// `autopgo.scrape.app=<app>` plus a `status.phase=Running` field selector.
/// Scheme, port and path come from `autopgo.scrape.*` annotations.
pub struct KubernetesSource {
    http: reqwest::Client,
    server: String,
    token: String,
    label_selector: String,
}

impl KubernetesSource {
    /// Build a source from the in-cluster environment: the API server
    /// address from `KUBERNETES_SERVICE_{HOST,PORT}` and credentials from
    /// the mounted service account.
    pub fn in_cluster(app: &str) -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .context("KUBERNETES_SERVICE_PORT is not set")?;

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))
            .context("reading service account token")?
            .trim()
            .to_string();

        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))
            .context("reading cluster CA certificate")?;
        let certificate =
            reqwest::Certificate::from_pem(&ca).context("parsing cluster CA certificate")?;

        let http = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            server: format!("https://{}", super::join_host_port(&host, &port)),
            token,
            label_selector: format!("{SCRAPE_LABEL}=true,{APP_LABEL}={app}"),
        })
    }

    async fn list_pods(&self) -> Result<PodList> {
        let url = format!("{}/api/v1/pods", self.server);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("labelSelector", self.label_selector.as_str()),
                ("fieldSelector", &format!("status.phase={RUNNING_PHASE}")),
            ])
            .send()
            .await
            .context("listing pods")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("unexpected status {status} listing pods: {body}");
        }

        response.json().await.context("decoding pod list")
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Pod {
    #[serde(default)]
    pub metadata: PodMetadata,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PodStatus {
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
    #[serde(default)]
    pub phase: String,
}

/// Convert listed pods into scrape targets. Pods without a pod IP or a port
/// annotation are skipped with a warning.
pub(crate) fn pods_to_targets(pods: PodList) -> Vec<Target> {
    let mut targets = Vec::new();

    for pod in pods.items {
        if pod.status.pod_ip.is_empty() {
            warn!(
                pod = %pod.metadata.name,
                namespace = %pod.metadata.namespace,
                "ignoring pod with no pod ip",
            );
            continue;
        }

        if pod.status.phase != RUNNING_PHASE {
            warn!(
                pod = %pod.metadata.name,
                namespace = %pod.metadata.namespace,
                "ignoring pod that is not running",
            );
            continue;
        }

        let Some(port) = pod
            .metadata
            .annotations
            .get(PORT_LABEL)
            .filter(|p| !p.is_empty())
        else {
            warn!(
                pod = %pod.metadata.name,
                namespace = %pod.metadata.namespace,
                "ignoring pod with empty port annotation",
            );
            continue;
        };

        let scheme = pod
            .metadata
            .annotations
            .get(SCHEME_LABEL)
            .map(String::as_str)
            .unwrap_or_default();

        targets.push(Target {
            address: target_address(scheme, &pod.status.pod_ip, port),
            path: pod
                .metadata
                .annotations
                .get(PATH_LABEL)
                .cloned()
                .unwrap_or_default(),
        });
    }

    targets
}

#[async_trait]
impl Checker for KubernetesSource {
    fn name(&self) -> String {
        "kubernetes".to_string()
    }

    async fn check(&self) -> Result<()> {
        self.list_pods().await.map(|_| ())
    }
}

#[async_trait]
impl TargetSource for KubernetesSource {
    async fn list(&self) -> Result<Vec<Target>> {
        debug!("listing kubernetes pods");
        let pods = self.list_pods().await?;
        debug!(count = pods.items.len(), "found labelled pods");

        Ok(pods_to_targets(pods))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_list(json: &str) -> PodList {
        serde_json::from_str(json).expect("pod list should decode")
    }

    #[test]
    fn test_pods_to_targets() {
        let pods = pod_list(
            r#"{
                "items": [
                    {
                        "metadata": {
                            "name": "svc1-abc",
                            "namespace": "default",
                            "annotations": {
                                "autopgo.scrape.port": "8080",
                                "autopgo.scrape.path": "/custom/profile"
                            }
                        },
                        "status": {"podIP": "10.1.0.4", "phase": "Running"}
                    }
                ]
            }"#,
        );

        let targets = pods_to_targets(pods);
        assert_eq!(
            targets,
            vec![Target {
                address: "http://10.1.0.4:8080".to_string(),
                path: "/custom/profile".to_string(),
            }],
        );
    }

    #[test]
    fn test_scheme_annotation_respected() {
        let pods = pod_list(
            r#"{
                "items": [
                    {
                        "metadata": {
                            "name": "svc1-abc",
                            "annotations": {
                                "autopgo.scrape.port": "8443",
                                "autopgo.scrape.scheme": "https"
                            }
                        },
                        "status": {"podIP": "10.1.0.4", "phase": "Running"}
                    }
                ]
            }"#,
        );

        assert_eq!(pods_to_targets(pods)[0].address, "https://10.1.0.4:8443");
    }

    #[test]
    fn test_skips_pod_without_ip_or_port() {
        let pods = pod_list(
            r#"{
                "items": [
                    {
                        "metadata": {"name": "no-ip", "annotations": {"autopgo.scrape.port": "8080"}},
                        "status": {"phase": "Running"}
                    },
                    {
                        "metadata": {"name": "no-port"},
                        "status": {"podIP": "10.1.0.5", "phase": "Running"}
                    },
                    {
                        "metadata": {"name": "pending", "annotations": {"autopgo.scrape.port": "8080"}},
                        "status": {"podIP": "10.1.0.6", "phase": "Pending"}
                    }
                ]
            }"#,
        );

        assert!(pods_to_targets(pods).is_empty());
    }
}
