use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::health::HealthState;
use crate::urlutil::append_query;

/// Outcome of probing a single upstream.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub url: String,
    pub available: bool,
    pub latency_seconds: Option<f64>,
    pub error: Option<String>,
    pub response_length_bytes: Option<usize>,
    pub timestamp: f64,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Builds the shared `reqwest::Client` used by every probe: bounded
/// connection pool, keep-alive, and an identifying User-Agent.
pub fn build_probe_client(check_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(check_timeout)
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent("DeepLX-API-Checker/1.0")
        .build()
        .expect("probe client configuration is valid")
}

/// Semantic-validating health prober. Holds a shared, connection-pooled
/// client; fans out batch probes under a bounded semaphore.
pub struct Prober {
    client: reqwest::Client,
    health: Arc<HealthState>,
    check_timeout: Duration,
    max_workers: usize,
    test_text: String,
    test_source_lang: String,
    test_target_lang: String,
}

impl Prober {
    pub fn new(
        health: Arc<HealthState>,
        check_timeout: Duration,
        max_workers: usize,
        test_text: String,
        test_source_lang: String,
        test_target_lang: String,
    ) -> Self {
        Self {
            client: build_probe_client(check_timeout),
            health,
            check_timeout,
            max_workers,
            test_text,
            test_source_lang,
            test_target_lang,
        }
    }

    /// Probes a single URL: one POST, semantic validation of the response,
    /// and a `HealthState.update` call before returning.
    pub async fn probe_one(&self, url: &str) -> ProbeResult {
        let request_id = Uuid::new_v4().to_string();
        let body = serde_json::json!({
            "text": self.test_text,
            "source_lang": self.test_source_lang,
            "target_lang": self.test_target_lang,
            "request_id": request_id,
        });

        let cache_buster = format!("nocache={}", chrono::Utc::now().timestamp_millis());
        let request_url = append_query(url, &cache_buster);

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            self.check_timeout,
            self.client.post(&request_url).json(&body).send(),
        )
        .await;

        let (available, latency, error, response_length) = match outcome {
            Err(_) => (false, None, Some("Connection timeout".to_string()), None),
            Ok(Err(e)) => {
                let msg = e.to_string();
                let truncated: String = msg.chars().take(100).collect();
                (
                    false,
                    None,
                    Some(format!("Connection error: {truncated}")),
                    None,
                )
            }
            Ok(Ok(response)) => {
                let latency = start.elapsed().as_secs_f64();
                let status = response.status();
                if status.as_u16() != 200 {
                    let body_text = response.text().await.unwrap_or_default();
                    let mut reason = format!("HTTP {}", status.as_u16());
                    if !body_text.is_empty() && body_text.len() < 200 {
                        reason.push_str(&format!(": {body_text}"));
                    }
                    (false, None, Some(reason), None)
                } else {
                    match response.json::<Value>().await {
                        Err(_) => (false, None, Some("Invalid JSON response".to_string()), None),
                        Ok(parsed) => match parsed.get("data") {
                            None | Some(Value::Null) => (
                                false,
                                None,
                                Some(
                                    "Invalid response format - missing 'data' field".to_string(),
                                ),
                                None,
                            ),
                            Some(data) => {
                                let text = value_as_text(data);
                                if text.is_empty()
                                    || text.trim().is_empty()
                                    || text == self.test_text
                                {
                                    (
                                        false,
                                        None,
                                        Some("Empty or invalid translation response".to_string()),
                                        None,
                                    )
                                } else {
                                    (true, Some(latency), None, Some(text.len()))
                                }
                            }
                        },
                    }
                }
            }
        };

        self.health
            .update(url, available, latency, response_length)
            .await;

        ProbeResult {
            url: url.to_string(),
            available,
            latency_seconds: latency,
            error,
            response_length_bytes: response_length,
            timestamp: now_epoch(),
        }
    }

    /// Probes every URL under a semaphore of size `min(max_workers, urls.len())`,
    /// logging progress every 10 completions, and returns results sorted
    /// available-first (ascending latency) then unavailable.
    pub async fn probe_many(&self, urls: &[String]) -> Vec<ProbeResult> {
        if urls.is_empty() {
            return Vec::new();
        }

        let permits = self.max_workers.min(urls.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut futs = FuturesUnordered::new();
        for url in urls {
            let sem = Arc::clone(&semaphore);
            let url = url.clone();
            futs.push(async move {
                let _permit = sem.acquire().await;
                self.probe_one(&url).await
            });
        }

        let total = urls.len();
        let mut completed = 0usize;
        let mut results = Vec::with_capacity(total);

        loop {
            match futs.next().await {
                Some(result) => {
                    results.push(result);
                    completed += 1;
                    if completed % 10 == 0 || completed == total {
                        info!("URL check progress: {completed}/{total} completed");
                    }
                }
                None => break,
            }
        }

        sort_results(&mut results);
        results
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn sort_results(results: &mut [ProbeResult]) {
    results.sort_by(|a, b| match (a.available, b.available) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (true, true) => a
            .latency_seconds
            .unwrap_or(f64::INFINITY)
            .partial_cmp(&b.latency_seconds.unwrap_or(f64::INFINITY))
            .unwrap_or(std::cmp::Ordering::Equal),
        (false, false) => std::cmp::Ordering::Equal,
    });
}

/// Logs a warning when a batch fan-out is abandoned mid-flight; the caller
/// still keeps whatever results were already collected.
pub fn warn_fanout_cancelled(collected: usize, total: usize) {
    warn!("URL probe fan-out cancelled after {collected}/{total} results; keeping partial results");
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_prober(health: Arc<HealthState>) -> Prober {
        Prober::new(
            health,
            Duration::from_secs(2),
            5,
            "Hello, world".to_string(),
            "EN".to_string(),
            "ZH".to_string(),
        )
    }

    #[tokio::test]
    async fn marks_healthy_on_valid_translation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": "你好世界"
            })))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let prober = test_prober(health.clone());
        let url = format!("{}/translate", server.uri());
        let result = prober.probe_one(&url).await;

        assert!(result.available);
        assert!(result.error.is_none());
        let record = health.get(&url).await.unwrap();
        assert!(record.available);
    }

    #[tokio::test]
    async fn echo_server_is_marked_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": "Hello, world"
            })))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let prober = test_prober(health);
        let url = format!("{}/translate", server.uri());
        let result = prober.probe_one(&url).await;

        assert!(!result.available);
        assert_eq!(
            result.error.as_deref(),
            Some("Empty or invalid translation response")
        );
    }

    #[tokio::test]
    async fn missing_data_field_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok"
            })))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let prober = test_prober(health);
        let url = format!("{}/translate", server.uri());
        let result = prober.probe_one(&url).await;

        assert!(!result.available);
        assert_eq!(
            result.error.as_deref(),
            Some("Invalid response format - missing 'data' field")
        );
    }

    #[tokio::test]
    async fn http_500_is_reported_with_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/translate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let prober = test_prober(health);
        let url = format!("{}/translate", server.uri());
        let result = prober.probe_one(&url).await;

        assert!(!result.available);
        assert_eq!(result.error.as_deref(), Some("HTTP 500: boom"));
    }

    #[tokio::test]
    async fn probe_many_sorts_available_first_by_latency() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "x"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let prober = test_prober(health);
        let urls = vec![
            format!("{}/down", server.uri()),
            format!("{}/fast", server.uri()),
        ];
        let results = prober.probe_many(&urls).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].available);
        assert!(!results[1].available);
    }

    #[tokio::test]
    async fn probe_many_empty_input_returns_empty() {
        let health = Arc::new(HealthState::new());
        let prober = test_prober(health);
        assert!(prober.probe_many(&[]).await.is_empty());
    }
}
