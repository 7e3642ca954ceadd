//! HTTP transports
//!
//! `HttpTransport` is the seam between the resilience logic and the wire.
//! Production uses `ReqwestTransport`; tests script responses through the
//! same trait.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

use super::types::{FetchRequest, TransportError};

/// Streamed response body
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// Response headers plus a lazily consumed body
pub struct TransportResponse {
    pub status: u16,
    /// From `Content-Length`, when the server sent one
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl TransportResponse {
    /// Response whose body is already in memory, delivered in `chunk_size` pieces
    pub fn from_bytes(status: u16, data: Vec<u8>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let chunks: Vec<Result<Vec<u8>, TransportError>> =
            data.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
        Self {
            status,
            content_length: Some(data.len() as u64),
            body: futures::stream::iter(chunks).boxed(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one request and returns the status with a streamed body
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else if error.is_body() || error.is_decode() {
        TransportError::Body(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        // `request.timeout` is enforced by the caller per wait, not over the whole body
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_length = response.content_length();

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_reqwest_error))
            .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}
