//! Per-worker cache of tag statistics used as prompt context.
//!
//! Entries may be stale for up to the TTL; the statistics only steer the
//! model towards reusing existing tags.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;
use todoai_models::TagStatistics;
use todoai_store::TagStatisticsRepository;

struct CachedStats {
    stats: TagStatistics,
    loaded_at: Instant,
}

/// TTL cache keyed by user id.
pub struct TagStatsCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedStats>>,
}

impl TagStatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh entry for `user_id`, if any.
    pub async fn get(&self, user_id: &str) -> Option<TagStatistics> {
        let entries = self.entries.read().await;
        entries
            .get(user_id)
            .filter(|e| e.loaded_at.elapsed() < self.ttl)
            .map(|e| e.stats.clone())
    }

    /// Store `stats`, evicting every expired entry.
    pub async fn insert(&self, stats: TagStatistics) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.loaded_at.elapsed() < self.ttl);
        entries.insert(
            stats.user_id.clone(),
            CachedStats {
                stats,
                loaded_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, user_id: &str) {
        self.entries.write().await.remove(user_id);
    }

    /// Cached statistics, loading through `repo` on a miss. Load failures
    /// yield `None`.
    pub async fn get_or_load(
        &self,
        user_id: &str,
        repo: &dyn TagStatisticsRepository,
    ) -> Option<TagStatistics> {
        if let Some(stats) = self.get(user_id).await {
            return Some(stats);
        }
        match repo.get_or_create(user_id).await {
            Ok(stats) => {
                self.insert(stats.clone()).await;
                Some(stats)
            }
            Err(e) => {
                debug!(user_id, "Tag statistics unavailable for prompt context: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use todoai_store::MemoryTagStatisticsRepository;

    #[tokio::test]
    async fn test_loads_once_within_ttl() {
        let repo = MemoryTagStatisticsRepository::new();
        let cache = TagStatsCache::new(Duration::from_secs(60));

        assert!(cache.get_or_load("u1", &repo).await.is_some());
        assert!(cache.get_or_load("u1", &repo).await.is_some());
        assert_eq!(repo.call_count(), 1);

        cache.invalidate("u1").await;
        assert!(cache.get("u1").await.is_none());
        cache.get_or_load("u1", &repo).await;
        assert_eq!(repo.call_count(), 2);
    }

    #[tokio::test]
    async fn test_expired_entries_are_ignored() {
        let cache = TagStatsCache::new(Duration::ZERO);
        cache.insert(TagStatistics::empty("u1")).await;
        assert!(cache.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn test_insert_evicts_expired_entries() {
        let cache = TagStatsCache::new(Duration::from_millis(50));
        cache.insert(TagStatistics::empty("u1")).await;
        cache.insert(TagStatistics::empty("u2")).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        cache.insert(TagStatistics::empty("u3")).await;
        let entries = cache.entries.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("u3"));
    }
}
