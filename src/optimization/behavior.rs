//! Bounded behavior and popularity state

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use super::types::{BehaviorUpdate, UserBehaviorPattern};

#[derive(Debug, Default, Clone)]
struct DocumentPopularity {
    views: u64,
    page_views: HashMap<u32, u64>,
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Per-user patterns and per-document popularity, both LRU-bounded
pub struct BehaviorTracker {
    patterns: LruCache<(String, String), UserBehaviorPattern>,
    popularity: LruCache<String, DocumentPopularity>,
    max_page_history: usize,
}

impl BehaviorTracker {
    pub fn new(max_patterns: usize, max_documents: usize, max_page_history: usize) -> Self {
        Self {
            patterns: LruCache::new(capacity(max_patterns)),
            popularity: LruCache::new(capacity(max_documents)),
            max_page_history,
        }
    }

    pub fn record(&mut self, update: &BehaviorUpdate) {
        let key = (update.user_id.clone(), update.document_id.clone());
        self.patterns
            .get_or_insert_mut(key, || {
                UserBehaviorPattern::new(&update.user_id, &update.document_id, update.at)
            })
            .record(update, self.max_page_history);

        let popularity = self
            .popularity
            .get_or_insert_mut(update.document_id.clone(), DocumentPopularity::default);
        popularity.views += 1;
        *popularity.page_views.entry(update.page).or_default() += 1;
    }

    pub fn pattern(&self, user_id: &str, document_id: &str) -> Option<&UserBehaviorPattern> {
        self.patterns
            .peek(&(user_id.to_string(), document_id.to_string()))
    }

    pub fn popularity(&self, document_id: &str) -> u64 {
        self.popularity
            .peek(document_id)
            .map(|p| p.views)
            .unwrap_or(0)
    }

    /// Most viewed pages of a document, most popular first
    pub fn popular_pages(&self, document_id: &str) -> Vec<u32> {
        let Some(popularity) = self.popularity.peek(document_id) else {
            return Vec::new();
        };
        let mut ranked: Vec<(u32, u64)> = popularity
            .page_views
            .iter()
            .map(|(&page, &views)| (page, views))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(page, _)| page).collect()
    }

    /// Documents with at least `threshold` views, most viewed first
    pub fn popular_documents(&self, threshold: u64) -> Vec<(String, u64)> {
        let mut documents: Vec<(String, u64)> = self
            .popularity
            .iter()
            .filter(|(_, p)| p.views >= threshold)
            .map(|(id, p)| (id.clone(), p.views))
            .collect();
        documents.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        documents
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
        self.popularity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patterns_are_lru_bounded() {
        let mut tracker = BehaviorTracker::new(2, 10, 50);
        tracker.record(&BehaviorUpdate::new("alice", "doc", 1));
        tracker.record(&BehaviorUpdate::new("bob", "doc", 1));
        tracker.record(&BehaviorUpdate::new("carol", "doc", 1));

        assert_eq!(tracker.pattern_count(), 2);
        assert!(tracker.pattern("alice", "doc").is_none());
        assert!(tracker.pattern("carol", "doc").is_some());
        // Popularity is tracked per document, not per pattern
        assert_eq!(tracker.popularity("doc"), 3);
    }

    #[test]
    fn test_popular_pages_and_documents() {
        let mut tracker = BehaviorTracker::new(10, 10, 50);
        for page in [1, 4, 4, 4, 2, 2] {
            tracker.record(&BehaviorUpdate::new("alice", "a", page));
        }
        tracker.record(&BehaviorUpdate::new("bob", "b", 1));

        assert_eq!(tracker.popular_pages("a"), vec![4, 2, 1]);
        assert_eq!(tracker.popular_documents(2), vec![("a".to_string(), 6)]);
        assert!(tracker.popular_pages("missing").is_empty());
    }
}
