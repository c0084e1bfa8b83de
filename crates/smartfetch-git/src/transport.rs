//! HTTP transport abstraction.
//!
//! The fetch client never talks to the network directly. It builds
//! [`HttpRequest`]s and hands them to a [`Transport`], which lets tests script
//! a remote and lets embedders bring their own HTTP stack.

use crate::{FetchError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio_util::io::StreamReader;

/// Service name used for fetching.
pub const UPLOAD_PACK: &str = "git-upload-pack";

/// Response body as a stream of chunks.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Response body as an async reader.
pub type BodyReader = StreamReader<BodyStream, Bytes>;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
        }
    }
}

/// An HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// `GET {url}/info/refs?service=git-upload-pack`.
    pub fn info_refs(url: &str) -> Self {
        Self {
            method: Method::Get,
            url: format!("{}/info/refs?service={UPLOAD_PACK}", base_url(url)),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `POST {url}/git-upload-pack` with a pkt-line body.
    pub fn upload_pack(url: &str, body: Bytes) -> Self {
        Self {
            method: Method::Post,
            url: format!("{}/{UPLOAD_PACK}", base_url(url)),
            headers: vec![
                (
                    "Content-Type".to_string(),
                    format!("application/x-{UPLOAD_PACK}-request"),
                ),
                (
                    "Accept".to_string(),
                    format!("application/x-{UPLOAD_PACK}-response"),
                ),
            ],
            body: Some(body),
        }
    }

    /// Looks up a header value, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// An HTTP response with a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    /// Creates a response from a body held in memory.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            body: stream::iter(std::iter::once(Ok(body))).boxed(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fails with [`FetchError::NetworkFailure`] on a non-2xx status.
    pub fn error_for_status(self, url: &str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::NetworkFailure(format!(
                "{url} answered with HTTP {}",
                self.status
            )))
        }
    }

    /// Turns the body into an async reader.
    pub fn into_reader(self) -> BodyReader {
        StreamReader::new(self.body)
    }
}

/// Sends HTTP requests for the fetch client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and returns the response without checking its status.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        (**self).send(request).await
    }
}

fn base_url(url: &str) -> &str {
    url.trim_end_matches('/')
}
