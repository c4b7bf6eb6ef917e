//! Typed HTTP client for the profile server, used by the scraper and the
//! CLI utilities.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Body, StatusCode, Url};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::api::ApiError;
use crate::operation::Checker;
use crate::profile::{ListResponse, ScrapeClient, StoredProfile};

/// The total timeout for any single request. Profile scrapes stream for the
/// configured profile duration, which must stay strictly below this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The error given when interacting with the profile server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The requested profile does not exist.
    #[error("does not exist")]
    NotExist,
    /// The server rejected the request.
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A client for the profile server's HTTP API.
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
}

impl Client {
    /// Create a client for the server at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("parsing api url {base_url:?}"))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;

        Ok(Self { base_url, http })
    }

    fn profile_url(&self, app: Option<&str>) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();

        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow::anyhow!("api url cannot be a base"))?;
            segments.pop_if_empty().extend(["api", "profile"]);
            if let Some(app) = app {
                segments.push(app);
            }
        }

        Ok(url)
    }

    async fn body_to_error(response: reqwest::Response) -> ClientError {
        match response.json::<ApiError>().await {
            Ok(api_error) => ClientError::Api(api_error),
            Err(e) => ClientError::Http(e),
        }
    }

    /// Upload the contents of an application's profile to the server.
    pub async fn upload(&self, app: &str, body: impl Into<Body>) -> Result<(), ClientError> {
        let url = self.profile_url(Some(app))?;
        debug!(url = %url, method = "POST", "performing HTTP request");

        let response = self.http.post(url).body(body).send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(Self::body_to_error(response).await);
        }

        Ok(())
    }

    /// Download the merged profile for an application, streaming its
    /// contents into the writer. Returns [`ClientError::NotExist`] if the
    /// application has no profile.
    pub async fn download<W>(&self, app: &str, writer: &mut W) -> Result<(), ClientError>
    where
        W: AsyncWrite + Unpin,
    {
        let url = self.profile_url(Some(app))?;
        debug!(url = %url, method = "GET", "performing HTTP request");

        let mut response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(ClientError::NotExist),
            _ => return Err(Self::body_to_error(response).await),
        }

        while let Some(chunk) = response.chunk().await? {
            writer
                .write_all(&chunk)
                .await
                .context("writing profile contents")?;
        }

        writer.flush().await.context("flushing profile contents")?;
        Ok(())
    }

    /// List all profiles stored within the server.
    pub async fn list(&self) -> Result<Vec<StoredProfile>, ClientError> {
        let url = self.profile_url(None)?;
        debug!(url = %url, method = "GET", "performing HTTP request");

        let response = self.http.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(Self::body_to_error(response).await);
        }

        let list: ListResponse = response.json().await?;
        Ok(list.profiles)
    }

    /// Delete the profile for an application, along with anything staged
    /// for it. Returns [`ClientError::NotExist`] if the application has no
    /// profile.
    pub async fn delete(&self, app: &str) -> Result<(), ClientError> {
        let url = self.profile_url(Some(app))?;
        debug!(url = %url, method = "DELETE", "performing HTTP request");

        let response = self.http.delete(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(ClientError::NotExist),
            _ => Err(Self::body_to_error(response).await),
        }
    }
}

#[async_trait]
impl ScrapeClient for Client {
    /// Profile the source URL for the given duration, piping the response
    /// body straight into an upload for the application.
    async fn profile_and_upload(
        &self,
        app: &str,
        source: &str,
        duration: Duration,
    ) -> Result<()> {
        let mut url =
            Url::parse(source).with_context(|| format!("parsing target url {source:?}"))?;
        url.set_query(Some(&format!("seconds={}", duration.as_secs())));

        debug!(url = %url, method = "GET", "performing HTTP request");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("requesting profile")?;

        let status = response.status();
        if status != StatusCode::OK {
            anyhow::bail!("target endpoint returned {}", status.as_u16());
        }

        let body = Body::wrap_stream(response.bytes_stream());
        self.upload(app, body)
            .await
            .context("uploading scraped profile")?;

        Ok(())
    }
}

#[async_trait]
impl Checker for Client {
    fn name(&self) -> String {
        format!("autopgo-server/{}", self.base_url)
    }

    async fn check(&self) -> Result<()> {
        let mut url = self.base_url.clone();

        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow::anyhow!("api url cannot be a base"))?;
            segments.pop_if_empty().extend(["api", "ready"]);
        }

        self.http
            .get(url)
            .send()
            .await
            .context("checking server readiness")?
            .error_for_status()
            .context("server is not ready")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_urls() {
        let client = Client::new("http://localhost:8080").expect("client");

        assert_eq!(
            client.profile_url(None).expect("url").as_str(),
            "http://localhost:8080/api/profile",
        );
        assert_eq!(
            client.profile_url(Some("svc1")).expect("url").as_str(),
            "http://localhost:8080/api/profile/svc1",
        );
    }

    #[test]
    fn test_base_url_with_path_prefix() {
        let client = Client::new("http://localhost:8080/autopgo").expect("client");

        assert_eq!(
            client.profile_url(Some("svc1")).expect("url").as_str(),
            "http://localhost:8080/autopgo/api/profile/svc1",
        );
    }

    #[test]
    fn test_rejects_malformed_base_url() {
        assert!(Client::new("not a url").is_err());
    }
}
