use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Per-upstream statistics. A copy is handed out by `get`/`snapshot`; callers
/// never get a live reference into the map.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub available: bool,
    pub latency_seconds: Option<f64>,
    pub response_length_bytes: Option<usize>,
    pub last_check_epoch: Option<f64>,
    pub last_success_epoch: Option<f64>,
    pub consecutive_failures: u32,
    pub total_checks: u64,
    pub success_rate: f64,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            available: true,
            latency_seconds: None,
            response_length_bytes: None,
            last_check_epoch: None,
            last_success_epoch: None,
            consecutive_failures: 0,
            total_checks: 0,
            success_rate: 1.0,
        }
    }
}

impl HealthRecord {
    /// 0-100 health score used by `/v1/urls/status`: starts at 100, loses
    /// up to 80 for consecutive failures and 10 more for high latency.
    pub fn health_score(&self) -> u32 {
        let mut score: i32 = 100;
        if self.consecutive_failures > 0 {
            score -= (self.consecutive_failures as i32 * 20).min(80);
        }
        if self.latency_seconds.unwrap_or(0.0) > 2.0 {
            score -= 10;
        }
        score.max(0) as u32
    }

    pub fn seconds_since_success(&self, now: f64) -> Option<f64> {
        self.last_success_epoch.map(|t| now - t)
    }
}

/// Shared health table, one record per upstream URL, lazily created on first
/// probe and never deleted. Serialized under a single lock; no I/O under lock.
#[derive(Debug, Default)]
pub struct HealthState {
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically update the record for `url`. Infallible; no external I/O.
    pub async fn update(
        &self,
        url: &str,
        success: bool,
        latency: Option<f64>,
        response_length: Option<usize>,
    ) {
        let now = now_epoch();
        let mut records = self.records.lock().await;
        let record = records.entry(url.to_string()).or_default();

        record.available = success;
        record.last_check_epoch = Some(now);
        if success {
            record.consecutive_failures = 0;
            record.last_success_epoch = Some(now);
            record.latency_seconds = latency;
            record.response_length_bytes = response_length;
        } else {
            record.consecutive_failures += 1;
        }
        record.total_checks += 1;

        let failures = record.consecutive_failures as f64;
        let total = record.total_checks as f64;
        record.success_rate = if total > 0.0 {
            ((total - failures) / total).max(0.0)
        } else {
            1.0
        };
    }

    pub async fn get(&self, url: &str) -> Option<HealthRecord> {
        self.records.lock().await.get(url).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_resets_failures_on_success() {
        let state = HealthState::new();
        state.update("http://a", false, None, None).await;
        state.update("http://a", false, None, None).await;
        let rec = state.get("http://a").await.unwrap();
        assert_eq!(rec.consecutive_failures, 2);
        assert_eq!(rec.total_checks, 2);

        state.update("http://a", true, Some(0.1), Some(5)).await;
        let rec = state.get("http://a").await.unwrap();
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.total_checks, 3);
        assert!(rec.last_success_epoch.is_some());
        assert!((rec.success_rate - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn invariants_hold_across_many_updates() {
        let state = HealthState::new();
        for i in 0..20 {
            state.update("http://a", i % 3 != 0, Some(0.05), Some(10)).await;
            let rec = state.get("http://a").await.unwrap();
            assert!(rec.total_checks >= rec.consecutive_failures as u64);
            assert!(rec.success_rate >= 0.0 && rec.success_rate <= 1.0);
        }
    }

    #[tokio::test]
    async fn unknown_url_returns_none() {
        let state = HealthState::new();
        assert!(state.get("http://missing").await.is_none());
    }
}
