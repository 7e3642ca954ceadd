//! Resilient fetch
//!
//! Expired signed URLs (401/403) are refreshed through the `UrlRefresher`
//! using the original URL and the request is reissued with the same headers
//! and timeout. Transient failures (connection errors, timeouts, 408/425/429,
//! 5xx) back off exponentially with jitter. Both loops share the configured
//! retry ceiling but count separately.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;

use super::refresh::UrlRefresher;
use super::transport::{HttpTransport, TransportResponse};
use super::types::{FetchRequest, FetchResponse, NetworkConfig, TransportError};
use crate::error::{ErrorRecord, RenderError, Result};
use crate::progress::{ProgressTracker, ProgressUpdate, RenderStage};
use crate::recovery::RenderContext;

/// Resilient HTTP fetcher
#[derive(Clone)]
pub struct NetworkResilience {
    transport: Arc<dyn HttpTransport>,
    refresher: Option<Arc<dyn UrlRefresher>>,
    progress: Option<ProgressTracker>,
    config: NetworkConfig,
}

impl NetworkResilience {
    pub fn new(transport: Arc<dyn HttpTransport>, config: NetworkConfig) -> Self {
        Self {
            transport,
            refresher: None,
            progress: None,
            config,
        }
    }

    /// Install the callback used to reissue expired signed URLs
    pub fn with_refresher(mut self, refresher: Arc<dyn UrlRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Report byte progress to `tracker` under each context's request id
    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.progress = Some(tracker);
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Fetch `url` on behalf of a render attempt
    ///
    /// Byte progress is written into `ctx.progress` (and the tracker, when
    /// configured) as chunks arrive. Failures that are retried here are
    /// appended to `ctx.error_history`.
    pub async fn fetch_data(&self, url: &str, ctx: &mut RenderContext) -> Result<FetchResponse> {
        self.execute(url, Some(ctx)).await
    }

    /// Fetch without progress reporting
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse> {
        self.execute(url, None).await
    }

    /// Exponential delay for the given retry (0-based), with jitter, capped at `max_delay`
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponential = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        let capped = exponential.min(self.config.max_delay);
        let jitter_ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        let jitter = if jitter_ratio > 0.0 {
            capped.mul_f64(rand::thread_rng().gen_range(0.0..=jitter_ratio))
        } else {
            Duration::ZERO
        };
        (capped + jitter).min(self.config.max_delay)
    }

    fn request_for(&self, url: &str) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            headers: self.config.headers.clone(),
            timeout: self.config.request_timeout,
        }
    }

    async fn execute(&self, url: &str, mut ctx: Option<&mut RenderContext>) -> Result<FetchResponse> {
        let mut current_url = url.to_string();
        let mut refreshes = 0u32;
        let mut transient_retries = 0u32;

        loop {
            let request = self.request_for(&current_url);
            let outcome = self.attempt(&request, ctx.as_deref_mut()).await;

            let error = match outcome {
                Ok(response) => {
                    if refreshes > 0 || transient_retries > 0 {
                        tracing::info!(
                            url = %current_url,
                            refreshes,
                            retries = transient_retries,
                            "Fetch succeeded after recovery"
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if let RenderError::Http { status: 401 | 403, .. } = error {
                if refreshes >= self.config.max_retries {
                    return Err(RenderError::Authentication(format!(
                        "signed URL still rejected after {} refreshes",
                        refreshes
                    )));
                }
                let Some(refresher) = &self.refresher else {
                    return Err(RenderError::Authentication(
                        "signed URL expired and no refresher is configured".to_string(),
                    ));
                };

                record(ctx.as_deref_mut(), &error, refreshes + 1);
                refreshes += 1;
                tracing::info!(url, attempt = refreshes, "Signed URL expired, refreshing");

                current_url = refresher.refresh(url).await.map_err(|e| {
                    tracing::warn!(url, "URL refresh failed: {}", e);
                    RenderError::Authentication(format!("URL refresh failed: {}", e))
                })?;
                continue;
            }

            if !error.is_retryable() || transient_retries >= self.config.max_retries {
                return Err(error);
            }

            record(ctx.as_deref_mut(), &error, transient_retries + 1);
            let delay = self.backoff_delay(transient_retries);
            transient_retries += 1;
            tracing::warn!(
                url = %current_url,
                retry = transient_retries,
                delay_ms = delay.as_millis() as u64,
                "Fetch failed, backing off: {}",
                error
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Send one request and drain its body
    ///
    /// The timeout bounds the wait for headers and each gap between chunks,
    /// so a slow transfer that keeps making progress is not cut off.
    async fn attempt(
        &self,
        request: &FetchRequest,
        mut ctx: Option<&mut RenderContext>,
    ) -> Result<FetchResponse> {
        let timeout = request.timeout;
        let timed_out = || RenderError::Timeout(timeout.as_millis() as u64);
        let response = tokio::time::timeout(timeout, self.transport.send(request))
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| e.into_render_error(timeout))?;

        if !response.is_success() {
            return Err(RenderError::Http {
                status: response.status,
                url: request.url.clone(),
            });
        }

        let TransportResponse {
            status,
            content_length,
            mut body,
        } = response;

        let mut data = Vec::with_capacity(content_length.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        self.report_bytes(ctx.as_deref_mut(), 0, content_length);

        while let Some(chunk) = tokio::time::timeout(timeout, body.next())
            .await
            .map_err(|_| timed_out())?
        {
            let chunk = chunk.map_err(|e: TransportError| e.into_render_error(timeout))?;
            data.extend_from_slice(&chunk);
            self.report_bytes(ctx.as_deref_mut(), data.len() as u64, content_length);
        }

        let bytes_received = data.len() as u64;
        tracing::debug!(url = %request.url, status, bytes = bytes_received, "Fetch complete");

        Ok(FetchResponse {
            status,
            data,
            bytes_received,
            url: request.url.clone(),
        })
    }

    fn report_bytes(&self, ctx: Option<&mut RenderContext>, loaded: u64, total: Option<u64>) {
        let Some(ctx) = ctx else {
            return;
        };
        let update = ProgressUpdate::bytes(loaded, total);
        ctx.progress.apply(&update);
        if let Some(tracker) = &self.progress {
            tracker.update(&ctx.request_id, update);
        }
    }
}

fn record(ctx: Option<&mut RenderContext>, error: &RenderError, attempt: u32) {
    if let Some(ctx) = ctx {
        let method = Some(ctx.current_method);
        ctx.error_history
            .push(ErrorRecord::from_error(error, method, RenderStage::Fetching, attempt));
    }
}
