//! Configuration management for the Amnesia render service

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::{BrowserCacheStrategy, CacheConfig};
use crate::diagnostics::DiagnosticsConfig;
use crate::network::NetworkConfig;
use crate::optimization::OptimizationConfig;
use crate::performance::PerformanceConfig;
use crate::progress::ProgressConfig;
use crate::renderer::RendererConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub network: NetworkConfig,
    pub render: RendererConfig,
    pub progress: ProgressConfig,
    pub cache: CacheConfig,
    pub optimization: OptimizationConfig,
    pub performance: PerformanceConfig,
    pub diagnostics: DiagnosticsConfig,
    pub preferences: PreferencesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferencesConfig {
    pub path: PathBuf,
}

impl Default for PreferencesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./viewer-preferences.json"),
        }
    }
}

/// Read and parse an environment variable, falling back to `default`
/// when it is unset or unparseable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable value for {}: {:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let server = ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
            port: env_or("SERVER_PORT", defaults.server.port),
        };

        let network = NetworkConfig {
            max_retries: env_or("NETWORK_MAX_RETRIES", defaults.network.max_retries),
            base_delay: env_millis("NETWORK_BASE_DELAY_MS", defaults.network.base_delay),
            max_delay: env_millis("NETWORK_MAX_DELAY_MS", defaults.network.max_delay),
            request_timeout: env_millis("NETWORK_TIMEOUT_MS", defaults.network.request_timeout),
            refresh_endpoint: env::var("URL_REFRESH_ENDPOINT").ok(),
            ..defaults.network
        };

        let render = RendererConfig {
            timeout: env_millis("RENDER_TIMEOUT_MS", defaults.render.timeout),
            max_retries_per_method: env_or(
                "RENDER_MAX_RETRIES",
                defaults.render.max_retries_per_method,
            ),
            fallback_enabled: env_or("RENDER_FALLBACK_ENABLED", defaults.render.fallback_enabled),
            default_scale: env_or("RENDER_DEFAULT_SCALE", defaults.render.default_scale),
            conversion_endpoint: env::var("SERVER_CONVERSION_ENDPOINT").ok(),
            ..defaults.render
        };

        let progress = ProgressConfig {
            stuck_detection_threshold: env_millis(
                "PROGRESS_STUCK_THRESHOLD_MS",
                defaults.progress.stuck_detection_threshold,
            ),
            cleanup_delay: env_millis("PROGRESS_CLEANUP_DELAY_MS", defaults.progress.cleanup_delay),
            min_update_interval: env_millis(
                "PROGRESS_MIN_UPDATE_INTERVAL_MS",
                defaults.progress.min_update_interval,
            ),
            orphan_subscription_ttl: env_millis(
                "PROGRESS_ORPHAN_TTL_MS",
                defaults.progress.orphan_subscription_ttl,
            ),
        };

        let cache = CacheConfig {
            max_memory_bytes: env_or("CACHE_MAX_MEMORY_BYTES", defaults.cache.max_memory_bytes),
            page_ttl: env_secs("CACHE_PAGE_TTL_SECS", defaults.cache.page_ttl),
            min_access_count: env_or("CACHE_MIN_ACCESS_COUNT", defaults.cache.min_access_count),
            browser_strategy: env::var("CACHE_BROWSER_STRATEGY")
                .ok()
                .and_then(|s| BrowserCacheStrategy::from_str(&s).ok())
                .unwrap_or(defaults.cache.browser_strategy),
            optimize_interval: env_secs(
                "CACHE_OPTIMIZE_INTERVAL_SECS",
                defaults.cache.optimize_interval,
            ),
        };

        let optimization = OptimizationConfig {
            max_preload_pages: env_or("PRELOAD_MAX_PAGES", defaults.optimization.max_preload_pages),
            popularity_threshold: env_or(
                "POPULARITY_THRESHOLD",
                defaults.optimization.popularity_threshold,
            ),
            warm_interval: env_secs("WARM_INTERVAL_SECS", defaults.optimization.warm_interval),
            max_patterns: env_or("BEHAVIOR_MAX_PATTERNS", defaults.optimization.max_patterns),
            ..defaults.optimization
        };

        let diagnostics = DiagnosticsConfig {
            purge_delay: env_millis("DIAGNOSTICS_PURGE_DELAY_MS", defaults.diagnostics.purge_delay),
        };

        let preferences = PreferencesConfig {
            path: env::var("PREFERENCES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.preferences.path),
        };

        Config {
            server,
            network,
            render,
            progress,
            cache,
            optimization,
            performance: defaults.performance,
            diagnostics,
            preferences,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.network.max_retries, 3);
        assert!(config.render.fallback_enabled);
        assert_eq!(config.cache.browser_strategy, BrowserCacheStrategy::Conservative);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("AMNESIA_RENDER_TEST_PORT", "not-a-number");
        let port: u16 = env_or("AMNESIA_RENDER_TEST_PORT", 8080);
        assert_eq!(port, 8080);
        env::remove_var("AMNESIA_RENDER_TEST_PORT");
    }

    #[test]
    fn test_env_millis_parses() {
        env::set_var("AMNESIA_RENDER_TEST_DELAY", "250");
        let delay = env_millis("AMNESIA_RENDER_TEST_DELAY", Duration::from_secs(1));
        assert_eq!(delay, Duration::from_millis(250));
        env::remove_var("AMNESIA_RENDER_TEST_DELAY");
    }
}
