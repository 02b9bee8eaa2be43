//! HTTP client with connection retries and a response size ceiling.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Method;
use thiserror::Error;

use crate::retry::RetryConfig;

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Cannot build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("Connection unavailable after {attempts} attempts: {source}")]
    ConnectionUnavailable {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// An outbound request.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ClientRequest {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// A response, possibly cut short.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: u16,
    pub body: Bytes,
    /// The body exceeded the size ceiling and was truncated.
    pub incomplete: bool,
}

impl ClientResponse {
    /// Body as lossy UTF-8.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client that retries connection establishment and bounds response
/// size.
#[derive(Debug, Clone)]
pub struct BoundedRetryingClient {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl BoundedRetryingClient {
    /// Create a client.
    ///
    /// # Errors
    /// Returns error if the TLS backend cannot be initialised.
    pub fn new(retry: RetryConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(retry.connect_timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self { http, retry })
    }

    /// Send `request` and read at most `max_response_bytes` of the body.
    ///
    /// A longer body is truncated, the connection dropped and the response
    /// flagged `incomplete`.
    ///
    /// # Errors
    /// Returns `ConnectionUnavailable` once every connection attempt failed,
    /// or `Transport` for any other failure, including mid-stream ones.
    pub async fn invoke(
        &self,
        request: &ClientRequest,
        max_response_bytes: usize,
    ) -> Result<ClientResponse, ClientError> {
        let response = self.send_with_retry(request).await?;
        let status = response.status().as_u16();

        let mut body = BytesMut::new();
        let mut incomplete = false;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            let room = max_response_bytes.saturating_sub(body.len());
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                incomplete = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        if incomplete {
            tracing::warn!(
                url = %request.url,
                limit = max_response_bytes,
                "Response exceeded size limit, truncated"
            );
        }
        Ok(ClientResponse {
            status,
            body: body.freeze(),
            incomplete,
        })
    }

    async fn send_with_retry(
        &self,
        request: &ClientRequest,
    ) -> Result<reqwest::Response, ClientError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let mut builder = self
                .http
                .request(request.method.clone(), &request.url)
                .body(request.body.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }

            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        tracing::error!(url = %request.url, attempts = attempt, "Connection unavailable: {e}");
                        return Err(ClientError::ConnectionUnavailable {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        url = %request.url,
                        attempt,
                        ?delay,
                        "Connection failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(ClientError::Transport(e)),
            }
        }
    }
}
