//! Service discovery against the Nomad services API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::operation::Checker;

use super::{tags_to_map, target_address, Target, TargetSource, PATH_LABEL, SCHEME_LABEL};

/// Lists scrapable services registered in a Nomad cluster. Services are
/// selected across all namespaces by the tags `autopgo.scrape=true` and
/// `autopgo.scrape.app=<app>`; scheme and path come from `autopgo.scrape.*`
/// tags.
pub struct NomadSource {
    http: reqwest::Client,
    address: String,
    filter: String,
}

impl NomadSource {
    pub fn new(address: &str, app: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            address: format!("http://{address}"),
            filter: format!(
                r#"Tags contains "autopgo.scrape=true" and Tags contains "autopgo.scrape.app={app}""#,
            ),
        })
    }

    async fn list_service_names(&self) -> Result<Vec<ServiceListStub>> {
        let url = format!("{}/v1/services", self.address);

        let response = self
            .http
            .get(&url)
            .query(&[("namespace", "*"), ("filter", self.filter.as_str())])
            .send()
            .await
            .context("listing nomad services")?
            .error_for_status()
            .context("listing nomad services")?;

        response.json().await.context("decoding nomad service list")
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Vec<ServiceRegistration>> {
        let url = format!("{}/v1/service/{name}", self.address);

        let response = self
            .http
            .get(&url)
            .query(&[("namespace", namespace), ("filter", self.filter.as_str())])
            .send()
            .await
            .with_context(|| format!("getting nomad service {name}"))?
            .error_for_status()
            .with_context(|| format!("getting nomad service {name}"))?;

        response
            .json()
            .await
            .with_context(|| format!("decoding nomad service {name}"))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceListStub {
    #[serde(default, rename = "Namespace")]
    pub namespace: String,
    #[serde(default, rename = "Services")]
    pub services: Vec<ServiceStub>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceStub {
    #[serde(default, rename = "ServiceName")]
    pub service_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceRegistration {
    #[serde(default, rename = "Address")]
    pub address: String,
    #[serde(default, rename = "Port")]
    pub port: u16,
    #[serde(default, rename = "Tags")]
    pub tags: Vec<String>,
}

pub(crate) fn registrations_to_targets(registrations: Vec<ServiceRegistration>) -> Vec<Target> {
    registrations
        .into_iter()
        .map(|service| {
            let tags = tags_to_map(&service.tags);

            Target {
                address: target_address(
                    tags.get(SCHEME_LABEL).map(String::as_str).unwrap_or_default(),
                    &service.address,
                    &service.port.to_string(),
                ),
                path: tags.get(PATH_LABEL).cloned().unwrap_or_default(),
            }
        })
        .collect()
}

#[async_trait]
impl Checker for NomadSource {
    fn name(&self) -> String {
        "nomad".to_string()
    }

    async fn check(&self) -> Result<()> {
        self.list_service_names().await.map(|_| ())
    }
}

#[async_trait]
impl TargetSource for NomadSource {
    async fn list(&self) -> Result<Vec<Target>> {
        debug!("listing nomad services");
        let namespaces = self.list_service_names().await?;
        debug!(count = namespaces.len(), "found namespaces with tagged services");

        let mut targets = Vec::new();
        for entry in namespaces {
            debug!(
                count = entry.services.len(),
                namespace = %entry.namespace,
                "found tagged services",
            );

            for stub in entry.services {
                let registrations = self
                    .get_service(&entry.namespace, &stub.service_name)
                    .await?;

                targets.extend(registrations_to_targets(registrations));
            }
        }

        Ok(targets)
    }
}
