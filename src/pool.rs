use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ProxyError;
use crate::health::HealthState;

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Per-upstream bookkeeping owned exclusively by the pool manager.
#[derive(Debug, Clone)]
struct PoolEntry {
    request_count: u64,
    last_used_epoch: f64,
    weight: f64,
}

impl Default for PoolEntry {
    fn default() -> Self {
        Self {
            request_count: 0,
            last_used_epoch: 0.0,
            weight: 1.0,
        }
    }
}

struct PoolInner {
    /// Insertion order is preserved; used to break score ties.
    urls: Vec<String>,
    entries: HashMap<String, PoolEntry>,
}

/// Owns the active URL set and selects the next upstream to dispatch to.
/// Reads HealthState to score candidates but never holds its own lock across I/O.
pub struct PoolManager {
    inner: Mutex<PoolInner>,
    health: Arc<HealthState>,
}

const MAX_CONSECUTIVE_FAILURES: u32 = 5;

impl PoolManager {
    pub fn new(urls: Vec<String>, health: Arc<HealthState>) -> Self {
        let cleaned = clean_urls(urls);
        let entries = cleaned
            .iter()
            .map(|u| (u.clone(), PoolEntry::default()))
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                urls: cleaned,
                entries,
            }),
            health,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.urls.len()
    }

    pub async fn urls(&self) -> Vec<String> {
        self.inner.lock().await.urls.clone()
    }

    /// Selects exactly one URL, scoring candidates under health data and
    /// never returning a stale choice. See SPEC_FULL.md §4.C for the formula.
    pub async fn next_url(&self) -> Result<String, ProxyError> {
        let now = now_epoch();
        let mut inner = self.inner.lock().await;

        if inner.urls.is_empty() {
            return Err(ProxyError::NoAvailableUpstreams);
        }

        let mut scored: Vec<(String, f64)> = Vec::new();
        for url in &inner.urls {
            let record = self.health.get(url).await;
            let consecutive_failures = record.as_ref().map(|r| r.consecutive_failures).unwrap_or(0);
            if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                continue;
            }
            let available = record.as_ref().map(|r| r.available).unwrap_or(true);
            if !available {
                continue;
            }

            let latency = record.as_ref().and_then(|r| r.latency_seconds).unwrap_or(1.0);
            let success_rate = record.as_ref().map(|r| r.success_rate).unwrap_or(1.0);
            let entry = inner.entries.get(url).cloned().unwrap_or_default();

            let request_load = entry.request_count as f64 * 0.005;
            let recent_usage = (10.0 - (now - entry.last_used_epoch)).max(0.0) * 0.05;
            let denom = (success_rate * entry.weight).max(f64::MIN_POSITIVE);
            let score = (latency + request_load + recent_usage) / denom;
            scored.push((url.clone(), score));
        }

        let selected = if scored.is_empty() {
            warn!("No available URLs found, using fallback random selection");
            inner
                .urls
                .choose(&mut rand::thread_rng())
                .cloned()
                .expect("checked non-empty above")
        } else {
            scored
                .into_iter()
                .fold(None, |best: Option<(String, f64)>, cand| match best {
                    None => Some(cand),
                    Some(b) if cand.1 < b.1 => Some(cand),
                    Some(b) => Some(b),
                })
                .expect("scored is non-empty")
                .0
        };

        let entry = inner.entries.entry(selected.clone()).or_default();
        entry.request_count += 1;
        entry.last_used_epoch = now;

        Ok(selected)
    }

    /// Replaces the active URL set, carrying over stats for URLs present in
    /// both the old and new set and discarding the rest. No-op on an empty list.
    pub async fn replace_urls(&self, new_urls: Vec<String>) {
        let cleaned = clean_urls(new_urls);
        if cleaned.is_empty() {
            warn!("No valid URLs provided for update");
            return;
        }

        let mut inner = self.inner.lock().await;
        let old_entries = inner.entries.clone();
        inner.entries = cleaned
            .iter()
            .map(|u| (u.clone(), old_entries.get(u).cloned().unwrap_or_default()))
            .collect();
        inner.urls = cleaned;
    }

    pub async fn request_counts(&self) -> HashMap<String, u64> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.request_count))
            .collect()
    }
}

fn clean_urls(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_url_fails_on_empty_pool() {
        let health = Arc::new(HealthState::new());
        let pool = PoolManager::new(vec![], health);
        assert!(matches!(
            pool.next_url().await,
            Err(ProxyError::NoAvailableUpstreams)
        ));
    }

    #[tokio::test]
    async fn next_url_skips_urls_over_failure_threshold() {
        let health = Arc::new(HealthState::new());
        let pool = PoolManager::new(
            vec!["http://a".to_string(), "http://b".to_string()],
            health.clone(),
        );
        for _ in 0..6 {
            health.update("http://a", false, None, None).await;
        }
        for _ in 0..5 {
            let chosen = pool.next_url().await.unwrap();
            assert_eq!(chosen, "http://b");
        }
    }

    #[tokio::test]
    async fn next_url_falls_back_to_random_when_all_filtered() {
        let health = Arc::new(HealthState::new());
        let pool = PoolManager::new(
            vec!["http://a".to_string(), "http://b".to_string()],
            health.clone(),
        );
        for url in ["http://a", "http://b"] {
            for _ in 0..6 {
                health.update(url, false, None, None).await;
            }
        }
        let chosen = pool.next_url().await.unwrap();
        assert!(chosen == "http://a" || chosen == "http://b");
    }

    #[tokio::test]
    async fn replace_urls_preserves_stats_for_surviving_urls() {
        let health = Arc::new(HealthState::new());
        let pool = PoolManager::new(
            vec!["http://a".to_string(), "http://b".to_string()],
            health,
        );
        pool.next_url().await.unwrap();
        pool.next_url().await.unwrap();
        let before = pool.request_counts().await;

        pool.replace_urls(vec!["http://a".to_string(), "http://c".to_string()])
            .await;
        let after = pool.request_counts().await;

        assert_eq!(after.get("http://a"), before.get("http://a"));
        assert!(!after.contains_key("http://b"));
        assert_eq!(after.get("http://c"), Some(&0));
    }

    #[tokio::test]
    async fn replace_urls_noop_on_empty_input() {
        let health = Arc::new(HealthState::new());
        let pool = PoolManager::new(vec!["http://a".to_string()], health);
        pool.replace_urls(vec!["".to_string(), "  ".to_string()])
            .await;
        assert_eq!(pool.urls().await, vec!["http://a".to_string()]);
    }
}
