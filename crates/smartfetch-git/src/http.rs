//! [`Transport`] backed by `reqwest`.

use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::{FetchError, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use std::time::Duration;

/// User agent sent with every request. Servers look for the `git/` prefix to
/// enable the smart protocol.
pub const USER_AGENT: &str = concat!("git/2.0 smartfetch/", env!("CARGO_PKG_VERSION"));

/// HTTP transport using a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport with a connect timeout.
    ///
    /// There is no overall timeout since packs can take arbitrarily long.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::NetworkFailure(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::NetworkFailure(format!("{} {}: {e}", request.method, request.url)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(HttpResponse { status, body })
    }
}
