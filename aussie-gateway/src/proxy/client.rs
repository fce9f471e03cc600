//! Upstream forwarding port and HTTP client implementation

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::PreparedProxyRequest;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// The upstream response as the core sees it
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why a forward failed, classified for the outcome mapping
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// The upstream exceeded the request deadline
    #[error("upstream request timed out")]
    Timeout,

    /// The connection could not be established
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The request was cancelled by the client
    #[error("request cancelled")]
    Cancelled,

    /// Any other transport failure
    #[error("upstream transport failure: {0}")]
    Transport(String),
}

/// Issues prepared requests upstream
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Forward a prepared request, honoring cancellation
    async fn forward(
        &self,
        request: &PreparedProxyRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ProxyResponse, ProxyError>;
}

/// reqwest-backed proxy client
pub struct HttpProxyClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpProxyClient {
    /// Build a client from the proxy configuration
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Forwarded requests must reach the configured backend, not
            // wherever it redirects
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build proxy client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout: config.request_timeout.duration(),
        })
    }

    fn classify(error: reqwest::Error) -> ProxyError {
        if error.is_timeout() {
            ProxyError::Timeout
        } else if error.is_connect() {
            ProxyError::Connect(error.to_string())
        } else {
            ProxyError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl ProxyClient for HttpProxyClient {
    async fn forward(
        &self,
        request: &PreparedProxyRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ProxyResponse, ProxyError> {
        let url = request.target_uri.to_string();
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone())
            .timeout(self.request_timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = builder.send() => result.map_err(Self::classify)?,
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            result = response.bytes() => result.map_err(Self::classify)?,
        };

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
