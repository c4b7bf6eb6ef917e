//! Sources of scrapable application instances.

mod consul;
mod file;
mod kubernetes;
mod nomad;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use consul::ConsulSource;
pub use file::FileSource;
pub use kubernetes::KubernetesSource;
pub use nomad::NomadSource;

use crate::blob::split_url;
use crate::operation::Checker;

/// A single application instance that can be scraped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// The target address, including scheme, host & port.
    pub address: String,
    /// The path to the profile endpoint, including the leading slash.
    /// Defaults to /debug/pprof/profile if unset.
    #[serde(default)]
    pub path: String,
}

pub const SCRAPE_LABEL: &str = "autopgo.scrape";
pub const APP_LABEL: &str = "autopgo.scrape.app";
pub const PORT_LABEL: &str = "autopgo.scrape.port";
pub const PATH_LABEL: &str = "autopgo.scrape.path";
pub const SCHEME_LABEL: &str = "autopgo.scrape.scheme";

/// A provider that lists scrapable endpoints and participates in health
/// checks.
#[async_trait]
pub trait TargetSource: Checker {
    async fn list(&self) -> Result<Vec<Target>>;
}

/// Open a discovery source described by a provider URL.
///
/// Supported schemes: `file://<path>` (JSON array of targets, reloaded on
/// SIGHUP), `kubernetes://` (in-cluster pod discovery), `nomad://<host:port>`
/// and `consul://<host:port>`.
pub async fn open_source(
    url: &str,
    app: &str,
    cancel: &CancellationToken,
) -> Result<Arc<dyn TargetSource>> {
    let (scheme, rest) = url.split_once("://").unwrap_or((url, ""));

    match scheme {
        "file" => {
            let (_, path) = split_url(url)?;
            Ok(Arc::new(FileSource::new(path, cancel).await?))
        }
        "kubernetes" => Ok(Arc::new(KubernetesSource::in_cluster(app)?)),
        "nomad" if !rest.is_empty() => Ok(Arc::new(NomadSource::new(rest, app)?)),
        "consul" if !rest.is_empty() => Ok(Arc::new(ConsulSource::new(rest, app)?)),
        _ => bail!("unsupported target source {url:?}"),
    }
}

/// Parse registry tags of the form `autopgo.scrape.path=/profile` into a
/// map. Tags not beginning with `autopgo` are skipped, as are tags without
/// a value.
pub(crate) fn tags_to_map(tags: &[String]) -> HashMap<String, String> {
    let mut out = HashMap::new();

    for tag in tags {
        if !tag.starts_with("autopgo") {
            continue;
        }

        if let Some((key, value)) = tag.split_once('=') {
            out.insert(key.to_string(), value.to_string());
        }
    }

    out
}

/// Join a host and port, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Build a target address from registry metadata, defaulting the scheme to
/// http.
pub(crate) fn target_address(scheme: &str, host: &str, port: &str) -> String {
    let scheme = if scheme.is_empty() { "http" } else { scheme };
    format!("{scheme}://{}", join_host_port(host, port))
}
