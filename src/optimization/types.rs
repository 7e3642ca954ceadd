//! Cache optimization types

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::BrowserCacheStrategy;
use crate::error::Result;
use crate::network::NetworkCondition;

/// Optimization service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizationConfig {
    /// Upper bound on pages returned by `predictive_preload`
    pub max_preload_pages: usize,
    /// Views after which a document counts as popular
    pub popularity_threshold: u64,
    pub warm_interval: Duration,
    /// Leading pages preloaded for each popular document
    pub warm_pages: u32,
    /// User/document behavior patterns kept
    pub max_patterns: usize,
    /// Documents tracked for popularity
    pub max_popular_documents: usize,
    /// Page views remembered per pattern
    pub max_page_history: usize,
    /// Accesses after which a user counts as frequent for a document
    pub frequent_user_threshold: u64,
    /// Hit rate (percent) below which a recommendation is made
    pub low_hit_rate: f64,
    /// Lookups required before the hit rate is judged
    pub min_lookups_for_hit_rate: u64,
    /// Fraction of the memory budget above which a recommendation is made
    pub high_memory_ratio: f64,
    pub slow_load_time: Duration,
    /// Downlink (Mbit/s) below which the network counts as slow
    pub slow_network_mbps: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            max_preload_pages: 5,
            popularity_threshold: 10,
            warm_interval: Duration::from_secs(600),
            warm_pages: 3,
            max_patterns: 1000,
            max_popular_documents: 1000,
            max_page_history: 50,
            frequent_user_threshold: 20,
            low_hit_rate: 50.0,
            min_lookups_for_hit_rate: 20,
            high_memory_ratio: 0.9,
            slow_load_time: Duration::from_secs(3),
            slow_network_mbps: 1.5,
        }
    }
}

/// One observed page view
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorUpdate {
    pub user_id: String,
    pub document_id: String,
    pub page: u32,
    pub session_duration: Option<Duration>,
    pub at: DateTime<Utc>,
}

impl BehaviorUpdate {
    pub fn new(user_id: &str, document_id: &str, page: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
            page,
            session_duration: None,
            at: Utc::now(),
        }
    }

    pub fn with_session(mut self, duration: Duration) -> Self {
        self.session_duration = Some(duration);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// Aggregated reading behavior of one user on one document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBehaviorPattern {
    pub user_id: String,
    pub document_id: String,
    pub access_count: u64,
    pub sessions: u64,
    pub average_session_ms: u64,
    /// Most recent page views, oldest first
    pub page_history: VecDeque<u32>,
    /// from page -> (to page -> count)
    pub transitions: HashMap<u32, HashMap<u32, u32>>,
    /// Views per UTC hour of day
    pub hourly_access: [u32; 24],
    pub last_access: DateTime<Utc>,
}

impl UserBehaviorPattern {
    pub fn new(user_id: &str, document_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
            access_count: 0,
            sessions: 0,
            average_session_ms: 0,
            page_history: VecDeque::new(),
            transitions: HashMap::new(),
            hourly_access: [0; 24],
            last_access: at,
        }
    }

    pub fn record(&mut self, update: &BehaviorUpdate, max_history: usize) {
        self.access_count += 1;

        if let Some(&previous) = self.page_history.back() {
            if previous != update.page {
                *self
                    .transitions
                    .entry(previous)
                    .or_default()
                    .entry(update.page)
                    .or_default() += 1;
            }
        }
        self.page_history.push_back(update.page);
        while self.page_history.len() > max_history.max(1) {
            self.page_history.pop_front();
        }

        if let Some(duration) = update.session_duration {
            let total = self.average_session_ms * self.sessions + duration.as_millis() as u64;
            self.sessions += 1;
            self.average_session_ms = total / self.sessions;
        }

        self.hourly_access[update.at.hour() as usize % 24] += 1;
        self.last_access = update.at;
    }

    /// Pages this user moved to from `page`, most frequent first
    pub fn likely_next_pages(&self, page: u32) -> Vec<u32> {
        let Some(targets) = self.transitions.get(&page) else {
            return Vec::new();
        };
        let mut ranked: Vec<(u32, u32)> = targets.iter().map(|(&to, &count)| (to, count)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(to, _)| to).collect()
    }

    /// Hour of day with the most views
    pub fn peak_hour(&self) -> Option<u32> {
        let (hour, count) = self
            .hourly_access
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))?;
        (*count > 0).then_some(hour as u32)
    }
}

/// Outcome of `optimize_cache_strategy`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStrategyDecision {
    pub document_id: String,
    pub network_condition: NetworkCondition,
    pub max_memory_bytes: usize,
    pub page_ttl_secs: u64,
    pub browser_strategy: BrowserCacheStrategy,
    pub frequent_user: bool,
    pub popular_document: bool,
}

/// Outcome of preloading a set of pages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadReport {
    pub requested: usize,
    pub already_cached: usize,
    pub preloaded: usize,
    pub failed: usize,
}

impl PreloadReport {
    pub fn merge(&mut self, other: PreloadReport) {
        self.requested += other.requested;
        self.already_cached += other.already_cached;
        self.preloaded += other.preloaded;
        self.failed += other.failed;
    }
}

/// Outcome of a warming pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmReport {
    pub documents: usize,
    pub pages: PreloadReport,
}

/// Renders a page into the memory tier ahead of demand
#[async_trait]
pub trait PagePreloader: Send + Sync {
    async fn preload_page(&self, document_id: &str, page: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pattern_records_transitions_and_sessions() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 21, 15, 0).unwrap();
        let mut pattern = UserBehaviorPattern::new("u1", "doc", at);

        for page in [1, 2, 3, 2, 3, 7] {
            pattern.record(&BehaviorUpdate::new("u1", "doc", page).at(at), 50);
        }
        pattern.record(
            &BehaviorUpdate::new("u1", "doc", 7)
                .at(at)
                .with_session(Duration::from_secs(60)),
            50,
        );
        pattern.record(
            &BehaviorUpdate::new("u1", "doc", 8)
                .at(at)
                .with_session(Duration::from_secs(120)),
            50,
        );

        assert_eq!(pattern.access_count, 8);
        assert_eq!(pattern.likely_next_pages(2), vec![3]);
        assert_eq!(pattern.likely_next_pages(3), vec![2, 7]);
        // Repeated views of the same page are not transitions
        assert_eq!(pattern.likely_next_pages(7), vec![8]);
        assert_eq!(pattern.sessions, 2);
        assert_eq!(pattern.average_session_ms, 90_000);
        assert_eq!(pattern.peak_hour(), Some(21));
    }

    #[test]
    fn test_page_history_is_capped() {
        let mut pattern = UserBehaviorPattern::new("u1", "doc", Utc::now());
        for page in 1..=60 {
            pattern.record(&BehaviorUpdate::new("u1", "doc", page), 50);
        }
        assert_eq!(pattern.page_history.len(), 50);
        assert_eq!(pattern.page_history.front(), Some(&11));
        assert_eq!(pattern.access_count, 60);
    }
}
