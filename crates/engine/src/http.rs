// HTTP access: the fetcher seam used by the scheduler and its reqwest implementation.
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::TidalError;
use crate::config::DownloaderConfig;
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::tls;

/// Fetches a whole resource body.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<Bytes, TidalError>;
}

/// Build the reqwest client from the downloader configuration.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, TidalError> {
    let mut client_builder = Client::builder()
        .use_preconfigured_tls(tls::client_config()?)
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.pool_idle_timeout(config.read_timeout);
    }

    client_builder.build().map_err(TidalError::from)
}

/// Retrying HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: &DownloaderConfig) -> Result<Self, TidalError> {
        Ok(Self {
            client: create_client(config)?,
            retry: config.retry.clone(),
        })
    }

    /// Send a GET and return the response once headers arrived with a 2xx
    /// status. The body is left for the caller to stream.
    pub async fn open(&self, url: &Url, token: &CancellationToken) -> Result<Response, TidalError> {
        retry_with_backoff(&self.retry, token, |attempt| async move {
            trace!(url = %url, attempt, "opening");
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return RetryAction::Fail(TidalError::Cancelled),
                result = self.send(url, "open") => result,
            };
            RetryAction::from_result(result)
        })
        .await
    }

    async fn send(&self, url: &Url, operation: &'static str) -> Result<Response, TidalError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TidalError::http_status(status, url.as_str(), operation));
        }
        Ok(response)
    }

    async fn fetch_once(&self, url: &Url) -> Result<Bytes, TidalError> {
        let response = self.send(url, "fetch").await?;
        let body = response.bytes().await?;
        debug!(url = %url, len = body.len(), "fetched");
        Ok(body)
    }
}

#[async_trait]
impl ResourceFetcher for HttpClient {
    async fn fetch(&self, url: &Url, token: &CancellationToken) -> Result<Bytes, TidalError> {
        retry_with_backoff(&self.retry, token, |_| async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return RetryAction::Fail(TidalError::Cancelled),
                result = self.fetch_once(url) => result,
            };
            RetryAction::from_result(result)
        })
        .await
    }
}
