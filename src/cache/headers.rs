//! Cache header generation for the browser and CDN tiers

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::types::BrowserCacheStrategy;

/// 7 days
const CONSERVATIVE_MAX_AGE_SECS: u64 = 7 * 24 * 3600;
/// 1 year
const AGGRESSIVE_MAX_AGE_SECS: u64 = 365 * 24 * 3600;
/// 1 hour
const MINIMAL_MAX_AGE_SECS: u64 = 3600;
/// 30 days
pub const CDN_MAX_AGE_SECS: u64 = 30 * 24 * 3600;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Ordered set of response headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CacheHeaders(BTreeMap<String, String>);

impl CacheHeaders {
    fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert into an HTTP header map, skipping anything unrepresentable
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.0 {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.insert(name, value);
                }
                _ => tracing::warn!("Skipping invalid cache header {}: {}", name, value),
            }
        }
        map
    }
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE_FORMAT).to_string()
}

/// Weak validator derived from the seed bytes
pub fn etag_for(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    format!("W/\"{}\"", hex::encode(&digest[..8]))
}

/// Headers for the browser tier
pub fn browser_headers(
    strategy: BrowserCacheStrategy,
    content_type: &str,
    etag_seed: &[u8],
    now: DateTime<Utc>,
) -> CacheHeaders {
    let mut headers = CacheHeaders::default();
    headers.insert("Content-Type", content_type);
    headers.insert("Vary", "Accept-Encoding");

    match strategy {
        BrowserCacheStrategy::Conservative => {
            headers.insert(
                "Cache-Control",
                format!("public, max-age={}, must-revalidate", CONSERVATIVE_MAX_AGE_SECS),
            );
            headers.insert("ETag", etag_for(etag_seed));
            headers.insert("Last-Modified", http_date(now));
        }
        BrowserCacheStrategy::Aggressive => {
            headers.insert(
                "Cache-Control",
                format!("public, max-age={}, immutable", AGGRESSIVE_MAX_AGE_SECS),
            );
            headers.insert(
                "Expires",
                http_date(now + ChronoDuration::seconds(AGGRESSIVE_MAX_AGE_SECS as i64)),
            );
        }
        BrowserCacheStrategy::Minimal => {
            headers.insert(
                "Cache-Control",
                format!("public, max-age={}", MINIMAL_MAX_AGE_SECS),
            );
        }
    }

    headers
}

/// Fixed 30-day immutable policy for the CDN tier
pub fn cdn_headers() -> CacheHeaders {
    let mut headers = CacheHeaders::default();
    headers.insert(
        "Cache-Control",
        format!("public, max-age={}, immutable", CDN_MAX_AGE_SECS),
    );
    headers.insert("CDN-Cache-Control", format!("public, max-age={}", CDN_MAX_AGE_SECS));
    headers.insert("Surrogate-Control", format!("max-age={}", CDN_MAX_AGE_SECS));
    headers.insert("Vary", "Accept-Encoding");
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conservative_headers() {
        let headers = browser_headers(
            BrowserCacheStrategy::Conservative,
            "image/png",
            b"doc:1:v1",
            Utc::now(),
        );
        assert_eq!(
            headers.get("cache-control"),
            Some("public, max-age=604800, must-revalidate")
        );
        assert!(headers.get("ETag").unwrap().starts_with("W/\""));
        assert!(headers.get("Last-Modified").unwrap().ends_with("GMT"));
        assert!(headers.get("Expires").is_none());
    }

    #[test]
    fn test_aggressive_headers() {
        let now = Utc::now();
        let headers = browser_headers(BrowserCacheStrategy::Aggressive, "image/png", b"", now);
        assert!(headers.get("Cache-Control").unwrap().contains("immutable"));
        assert!(headers.get("Expires").is_some());
        assert!(headers.get("ETag").is_none());
    }

    #[test]
    fn test_minimal_headers() {
        let headers = browser_headers(BrowserCacheStrategy::Minimal, "image/jpeg", b"", Utc::now());
        assert_eq!(headers.get("Cache-Control"), Some("public, max-age=3600"));
        assert_eq!(headers.get("Content-Type"), Some("image/jpeg"));
    }

    #[test]
    fn test_cdn_headers() {
        let headers = cdn_headers();
        assert_eq!(
            headers.get("Cache-Control"),
            Some("public, max-age=2592000, immutable")
        );
        assert!(headers.get("Surrogate-Control").is_some());
    }

    #[test]
    fn test_etag_is_stable_and_content_sensitive() {
        assert_eq!(etag_for(b"abc"), etag_for(b"abc"));
        assert_ne!(etag_for(b"abc"), etag_for(b"abd"));
    }

    #[test]
    fn test_to_header_map() {
        let map = cdn_headers().to_header_map();
        assert_eq!(map.len(), 4);
        assert!(map.contains_key("cdn-cache-control"));
    }
}
