//! Network layer types

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RenderError;

/// Resilient fetch configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Retry ceiling, applied separately to URL refreshes and to transient failures
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest wait for the response headers, and for each body chunk after them
    pub request_timeout: Duration,
    /// Fraction of the backoff delay added as random jitter
    pub jitter_ratio: f64,
    /// Headers sent with every request, including refreshed ones
    pub headers: Vec<(String, String)>,
    /// Endpoint used by `HttpUrlRefresher`
    pub refresh_endpoint: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            jitter_ratio: 0.25,
            headers: Vec::new(),
            refresh_endpoint: None,
        }
    }
}

/// One outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

/// Completed fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub data: Vec<u8>,
    pub bytes_received: u64,
    /// URL that finally answered; differs from the input after a refresh
    pub url: String,
}

/// Transport-level failure
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("body transfer failed: {0}")]
    Body(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub(crate) fn into_render_error(self, timeout: Duration) -> RenderError {
        match self {
            TransportError::Timeout => RenderError::Timeout(timeout.as_millis() as u64),
            other => RenderError::Network(other.to_string()),
        }
    }
}

/// URL refresh failure
#[derive(Debug, Clone, Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Request(String),

    #[error("refresh endpoint rejected the URL: HTTP {0}")]
    Rejected(u16),

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),
}

/// Coarse network quality bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkCondition {
    Slow,
    #[default]
    Moderate,
    Fast,
}

impl NetworkCondition {
    /// Bucket a measured downlink in Mbit/s
    pub fn from_downlink_mbps(downlink: f64) -> Self {
        if downlink < 1.5 {
            NetworkCondition::Slow
        } else if downlink < 10.0 {
            NetworkCondition::Moderate
        } else {
            NetworkCondition::Fast
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_buckets() {
        assert_eq!(NetworkCondition::from_downlink_mbps(0.5), NetworkCondition::Slow);
        assert_eq!(NetworkCondition::from_downlink_mbps(4.0), NetworkCondition::Moderate);
        assert_eq!(NetworkCondition::from_downlink_mbps(50.0), NetworkCondition::Fast);
    }

    #[test]
    fn test_transport_error_kinds() {
        use crate::error::ErrorKind;

        let timeout = TransportError::Timeout.into_render_error(Duration::from_secs(2));
        assert_eq!(timeout.kind(), ErrorKind::TimeoutError);

        let refused = TransportError::Connect("refused".into()).into_render_error(Duration::ZERO);
        assert_eq!(refused.kind(), ErrorKind::NetworkError);
    }
}
