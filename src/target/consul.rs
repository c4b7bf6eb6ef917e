//! Service discovery against the Consul catalogue API.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::operation::Checker;

use super::{tags_to_map, target_address, Target, TargetSource, PATH_LABEL, SCHEME_LABEL};

/// Lists scrapable services from the Consul catalogue. Semantics match the
/// Nomad source, with the filter applied to `ServiceTags`.
pub struct ConsulSource {
    http: reqwest::Client,
    address: String,
    filter: String,
}

impl ConsulSource {
    pub fn new(address: &str, app: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            address: format!("http://{address}"),
            filter: format!(
                r#"ServiceTags contains "autopgo.scrape=true" and ServiceTags contains "autopgo.scrape.app={app}""#,
            ),
        })
    }

    async fn list_service_names(&self) -> Result<HashMap<String, Vec<String>>> {
        let url = format!("{}/v1/catalog/services", self.address);

        let response = self
            .http
            .get(&url)
            .query(&[("filter", self.filter.as_str())])
            .send()
            .await
            .context("listing consul services")?
            .error_for_status()
            .context("listing consul services")?;

        response.json().await.context("decoding consul service list")
    }

    async fn get_service(&self, name: &str) -> Result<Vec<CatalogService>> {
        let url = format!("{}/v1/catalog/service/{name}", self.address);

        let response = self
            .http
            .get(&url)
            .query(&[("filter", self.filter.as_str())])
            .send()
            .await
            .with_context(|| format!("getting consul service {name}"))?
            .error_for_status()
            .with_context(|| format!("getting consul service {name}"))?;

        response
            .json()
            .await
            .with_context(|| format!("decoding consul service {name}"))
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogService {
    #[serde(default, rename = "ServiceAddress")]
    pub service_address: String,
    #[serde(default, rename = "ServicePort")]
    pub service_port: u16,
    #[serde(default, rename = "ServiceTags")]
    pub service_tags: Vec<String>,
}

pub(crate) fn services_to_targets(services: Vec<CatalogService>) -> Vec<Target> {
    services
        .into_iter()
        .map(|service| {
            let tags = tags_to_map(&service.service_tags);

            Target {
                address: target_address(
                    tags.get(SCHEME_LABEL).map(String::as_str).unwrap_or_default(),
                    &service.service_address,
                    &service.service_port.to_string(),
                ),
                path: tags.get(PATH_LABEL).cloned().unwrap_or_default(),
            }
        })
        .collect()
}

#[async_trait]
impl Checker for ConsulSource {
    fn name(&self) -> String {
        "consul".to_string()
    }

    async fn check(&self) -> Result<()> {
        self.list_service_names().await.map(|_| ())
    }
}

#[async_trait]
impl TargetSource for ConsulSource {
    async fn list(&self) -> Result<Vec<Target>> {
        debug!("listing consul services");
        let names = self.list_service_names().await?;
        debug!(count = names.len(), "found tagged services");

        let mut targets = Vec::new();
        for name in names.keys() {
            let services = self.get_service(name).await?;
            targets.extend(services_to_targets(services));
        }

        Ok(targets)
    }
}
