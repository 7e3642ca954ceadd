//! Signed URL refresh

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::types::RefreshError;

/// Reissues an expired signed URL
#[async_trait]
pub trait UrlRefresher: Send + Sync {
    /// Return a fresh URL for the same resource
    async fn refresh(&self, expired_url: &str) -> Result<String, RefreshError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    url: String,
}

/// Refresher backed by a signed-URL issuing endpoint
///
/// Sends `POST {endpoint}` with `{"url": "<expired>"}` and expects
/// `{"url": "<fresh>"}` back.
pub struct HttpUrlRefresher {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpUrlRefresher {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl UrlRefresher for HttpUrlRefresher {
    async fn refresh(&self, expired_url: &str) -> Result<String, RefreshError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RefreshRequest { url: expired_url })
            .send()
            .await
            .map_err(|e| RefreshError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RefreshError::Rejected(response.status().as_u16()));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

        if body.url.is_empty() {
            return Err(RefreshError::InvalidResponse("empty url".to_string()));
        }
        Ok(body.url)
    }
}

/// Adapts an async closure into a `UrlRefresher`
pub struct FnUrlRefresher<F>(F);

impl<F> FnUrlRefresher<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> UrlRefresher for FnUrlRefresher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, RefreshError>> + Send,
{
    async fn refresh(&self, expired_url: &str) -> Result<String, RefreshError> {
        (self.0)(expired_url.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_refresher() {
        let refresher = FnUrlRefresher::new(|url: String| async move {
            Ok::<_, RefreshError>(format!("{}?sig=new", url))
        });
        let fresh = refresher.refresh("https://cdn.example.com/a.pdf").await.unwrap();
        assert_eq!(fresh, "https://cdn.example.com/a.pdf?sig=new");
    }
}
