//! Lightweight HTTP transport

use super::{HeaderProfile, RawResponse};
use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, redirect::Policy, Client};
use std::time::Duration;
use thiserror::Error;

/// Maximum redirect hops followed by the HTTP client
const MAX_REDIRECTS: usize = 10;

/// Errors from a single lightweight request
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else {
            Self::Request(error.to_string())
        }
    }
}

/// Sends one GET request and returns the raw response
///
/// Implementations must not retry; retries belong to the fetch chain.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        url: &str,
        headers: &HeaderProfile,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;
}

/// Builds the shared HTTP client
///
/// The client carries no default user agent: every request sets its own
/// from the header profile.
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()
}

/// `Transport` backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client()?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        url: &str,
        headers: &HeaderProfile,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers.to_pairs() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        tracing::debug!(url, status, bytes = body.len(), "Received response");

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}
