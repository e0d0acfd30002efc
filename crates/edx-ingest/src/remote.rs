//! Remote Source collaborator
//!
//! HTTP existence probes and downloads, both under the shared retry policy.
//! A probe answers "is it there, and what is its signature"; a fetch returns
//! the bytes along with the same freshness headers.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::HttpSettings;
use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;

/// Freshness headers reported by the remote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FetchedBlob {
    pub bytes: Vec<u8>,
    pub meta: RemoteMeta,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// `Ok(None)` when the remote reports the resource as absent
    async fn probe(&self, url: &Url) -> Result<Option<RemoteMeta>>;

    async fn fetch(&self, url: &Url) -> Result<FetchedBlob>;

    async fn fetch_text(&self, url: &Url) -> Result<String>;
}

pub struct HttpRemote {
    client: Client,
    retry: RetryPolicy,
}

impl HttpRemote {
    pub fn new(settings: &HttpSettings, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()?;
        Ok(Self { client, retry })
    }

    async fn head_once(&self, url: &Url) -> Result<Option<RemoteMeta>> {
        let response = self.client.head(url.clone()).send().await?;
        let response = match response.status() {
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => {
                // some servers refuse HEAD; headers of a GET are as good
                self.client.get(url.clone()).send().await?
            },
            _ => response,
        };

        let status = response.status();
        if is_absent(status) {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(url, status));
        }
        if looks_like_html(&response) {
            debug!(url = %url, "Probe answered with an HTML page; treating as absent");
            return Ok(None);
        }
        Ok(Some(meta_from(&response)))
    }

    async fn get_once(&self, url: &Url) -> Result<FetchedBlob> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if is_absent(status) {
            return Err(IngestError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(status_error(url, status));
        }

        let mut meta = meta_from(&response);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        meta.size = meta.size.or(Some(bytes.len() as u64));

        Ok(FetchedBlob {
            bytes,
            meta,
            content_type,
        })
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    #[instrument(skip(self), fields(url = %url))]
    async fn probe(&self, url: &Url) -> Result<Option<RemoteMeta>> {
        self.retry.run("probe", || self.head_once(url)).await
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn fetch(&self, url: &Url) -> Result<FetchedBlob> {
        let blob = self.retry.run("fetch", || self.get_once(url)).await?;
        info!("Successfully downloaded {} ({} bytes)", url, blob.bytes.len());
        Ok(blob)
    }

    async fn fetch_text(&self, url: &Url) -> Result<String> {
        let blob = self.fetch(url).await?;
        Ok(String::from_utf8_lossy(&blob.bytes).into_owned())
    }
}

fn is_absent(status: StatusCode) -> bool {
    matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
}

fn status_error(url: &Url, status: StatusCode) -> IngestError {
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    IngestError::fetch(url.as_str(), format!("HTTP {}", status), retryable)
}

fn header_string(response: &Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn meta_from(response: &Response) -> RemoteMeta {
    RemoteMeta {
        etag: header_string(response, header::ETAG),
        last_modified: header_string(response, header::LAST_MODIFIED),
        size: header_string(response, header::CONTENT_LENGTH).and_then(|v| v.parse().ok()),
    }
}

fn looks_like_html(response: &Response) -> bool {
    header_string(response, header::CONTENT_TYPE)
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("text/html"))
}
