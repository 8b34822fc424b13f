use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::health::HealthState;
use crate::pool::PoolManager;
use crate::urlutil::append_query;
use crate::wire::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, ChunkDelta, ResponseMessage,
    SseError, SseErrorBody, Usage,
};

const MAX_SAME_URL_RETRIES: u32 = 3;
const SAME_URL_BACKOFF: Duration = Duration::from_millis(100);
const STREAM_CHUNK_SIZE: usize = 100;
const STREAM_CHUNK_PAUSE: Duration = Duration::from_millis(10);
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// End-to-end translation pipeline: select an upstream, POST, validate,
/// retry with a different upstream on failure, up to `max_retries`.
pub struct Dispatcher {
    pool: Arc<PoolManager>,
    health: Arc<HealthState>,
    client: reqwest::Client,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(pool: Arc<PoolManager>, health: Arc<HealthState>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .expect("dispatch client configuration is valid");
        Self {
            pool,
            health,
            client,
            timeout,
        }
    }

    /// Translates `text` from `source_lang` to `target_lang`. Returns the
    /// translated text, or the identity text with zero HTTP calls when the
    /// languages already match.
    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, ProxyError> {
        if source_lang == target_lang {
            return Ok(text.to_string());
        }

        let pool_len = self.pool.len().await;
        let max_retries = if pool_len == 0 {
            3
        } else {
            pool_len.clamp(1, 5)
        };

        let mut tried_urls: HashSet<String> = HashSet::new();
        let mut last_error = String::new();

        for attempt in 0..max_retries {
            let mut url = self.pool.next_url().await?;

            let mut same_url_retries = 0;
            while tried_urls.contains(&url) && same_url_retries < MAX_SAME_URL_RETRIES {
                sleep(SAME_URL_BACKOFF).await;
                url = self.pool.next_url().await?;
                same_url_retries += 1;
            }
            tried_urls.insert(url.clone());

            let request_id = Uuid::new_v4().to_string();
            let mut payload = serde_json::json!({
                "text": text,
                "target_lang": target_lang,
                "request_id": request_id,
            });
            if !source_lang.is_empty() {
                payload["source_lang"] = Value::String(source_lang.to_string());
            }

            let cache_buster = format!(
                "nocache={}&retry={}",
                chrono::Utc::now().timestamp_millis(),
                attempt
            );
            let request_url = append_query(&url, &cache_buster);

            let start = Instant::now();
            let outcome = tokio::time::timeout(
                self.timeout,
                self.client
                    .post(&request_url)
                    .header("Cache-Control", "no-cache")
                    .header("X-Request-ID", &request_id)
                    .json(&payload)
                    .send(),
            )
            .await;

            match self.classify(&url, start, outcome).await {
                Ok(translated) => return Ok(translated),
                Err(message) => {
                    warn!("Translation attempt {} failed on {}: {}", attempt + 1, url, message);
                    last_error = message;
                }
            }

            if attempt + 1 < max_retries {
                let backoff = (2f64.powi(attempt as i32) * 0.1).min(2.0);
                sleep(Duration::from_secs_f64(backoff)).await;
            }
        }

        Err(ProxyError::UpstreamExhausted {
            attempts: max_retries,
            last_error,
        })
    }

    /// Interprets one attempt's outcome, updates HealthState, and either
    /// returns the translated text or a short error message for the caller
    /// to remember and retry.
    async fn classify(
        &self,
        url: &str,
        start: Instant,
        outcome: Result<Result<reqwest::Response, reqwest::Error>, tokio::time::error::Elapsed>,
    ) -> Result<String, String> {
        match outcome {
            Err(_) => {
                self.health.update(url, false, None, None).await;
                Err(format!("Request timeout ({}s)", self.timeout.as_secs()))
            }
            Ok(Err(e)) => {
                self.health.update(url, false, None, None).await;
                Err(format!("Request error: {}", truncate(&e.to_string(), 200)))
            }
            Ok(Ok(response)) => {
                let latency = start.elapsed().as_secs_f64();
                let status = response.status();
                if status.as_u16() != 200 {
                    let body = response.text().await.unwrap_or_default();
                    self.health.update(url, false, None, None).await;
                    Err(format!("HTTP {}: {}", status.as_u16(), truncate(&body, 200)))
                } else {
                    match response.json::<Value>().await {
                        Err(e) => {
                            self.health.update(url, false, None, None).await;
                            Err(format!("JSON decode error: {e}"))
                        }
                        Ok(parsed) => match parsed.get("data").filter(|d| !d.is_null()) {
                            Some(data) => {
                                let translated = value_as_text(data);
                                if translated.trim().is_empty() {
                                    self.health.update(url, false, None, None).await;
                                    Err(format!(
                                        "Invalid API response: {}",
                                        truncate(&parsed.to_string(), 200)
                                    ))
                                } else {
                                    self.health
                                        .update(url, true, Some(latency), Some(translated.len()))
                                        .await;
                                    debug!("Translation successful on {} in {:.3}s", url, latency);
                                    Ok(translated)
                                }
                            }
                            None => {
                                self.health.update(url, false, None, None).await;
                                Err(format!(
                                    "Invalid API response: {}",
                                    truncate(&parsed.to_string(), 200)
                                ))
                            }
                        },
                    }
                }
            }
        }
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Builds the single-shot JSON envelope for non-streaming responses.
pub fn build_completion_response(
    model: &str,
    prompt_text: &str,
    translated_text: &str,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: Uuid::new_v4().to_string(),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content: translated_text.to_string(),
            },
            finish_reason: "stop",
        }],
        usage: Usage::from_texts(prompt_text, translated_text),
    }
}

/// Splits `translated_text` into `chat.completion.chunk` SSE frames of at
/// most `STREAM_CHUNK_SIZE` characters each, followed by a terminal chunk
/// with `finish_reason: "stop"`. Does not include the `[DONE]` sentinel.
pub fn build_stream_chunks(
    message_id: &str,
    model: &str,
    created: i64,
    translated_text: &str,
) -> Vec<ChatCompletionChunk> {
    let mut chunks = Vec::new();
    let chars: Vec<char> = translated_text.chars().collect();
    for slice in chars.chunks(STREAM_CHUNK_SIZE) {
        let content: String = slice.iter().collect();
        chunks.push(ChatCompletionChunk {
            id: message_id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(content),
                },
                finish_reason: None,
            }],
        });
    }
    chunks.push(ChatCompletionChunk {
        id: message_id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta { content: None },
            finish_reason: Some("stop"),
        }],
    });
    chunks
}

pub fn sse_frame<T: serde::Serialize>(value: &T) -> String {
    format!("data: {}\n\n", serde_json::to_string(value).unwrap_or_default())
}

pub fn sse_error_frame(error: &ProxyError) -> String {
    let body = SseErrorBody {
        error: SseError {
            message: error.to_string(),
            error_type: error.error_type(),
            code: error.status_code().as_u16(),
        },
    };
    sse_frame(&body)
}

pub const fn stream_chunk_pause() -> Duration {
    STREAM_CHUNK_PAUSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthState;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher_over(pool: Arc<PoolManager>, health: Arc<HealthState>) -> Dispatcher {
        Dispatcher::new(pool, health, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn identical_languages_return_input_with_no_http_calls() {
        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![], health.clone()));
        let dispatcher = dispatcher_over(pool, health);
        let result = dispatcher.translate("Hello", "EN", "EN").await.unwrap();
        assert_eq!(result, "Hello");
    }

    #[tokio::test]
    async fn happy_path_returns_translation_and_marks_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "你好"})))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![server.uri()], health.clone()));
        let dispatcher = dispatcher_over(pool, health.clone());

        let result = dispatcher.translate("Hello", "EN", "ZH").await.unwrap();
        assert_eq!(result, "你好");

        let record = health.get(&server.uri()).await.unwrap();
        assert!(record.available);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.total_checks, 1);
    }

    #[tokio::test]
    async fn failover_to_second_upstream_on_error() {
        let bad = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;
        let good = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "Bonjour"})))
            .mount(&good)
            .await;

        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![bad.uri(), good.uri()], health.clone()));
        let dispatcher = dispatcher_over(pool, health.clone());

        let result = dispatcher.translate("Hello", "EN", "FR").await.unwrap();
        assert_eq!(result, "Bonjour");

        let bad_record = health.get(&bad.uri()).await.unwrap();
        assert_eq!(bad_record.consecutive_failures, 1);
        let good_record = health.get(&good.uri()).await.unwrap();
        assert_eq!(good_record.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhaustion_returns_service_unavailable_with_http_status_in_message() {
        let a = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&a)
            .await;
        let b = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&b)
            .await;

        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![a.uri(), b.uri()], health.clone()));
        let dispatcher = dispatcher_over(pool, health.clone());

        let err = dispatcher.translate("Hello", "EN", "FR").await.unwrap_err();
        match err {
            ProxyError::UpstreamExhausted { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("HTTP 500"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(health.get(&a.uri()).await.unwrap().consecutive_failures >= 1);
        assert!(health.get(&b.uri()).await.unwrap().consecutive_failures >= 1);
    }

    #[tokio::test]
    async fn empty_pool_fails_fast_without_retries() {
        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![], health.clone()));
        let dispatcher = dispatcher_over(pool, health);

        let err = dispatcher.translate("Hello", "EN", "FR").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAvailableUpstreams));
    }

    #[test]
    fn stream_chunks_split_at_100_chars_with_terminal_stop_chunk() {
        let text: String = "a".repeat(350);
        let chunks = build_stream_chunks("id", "model", 0, &text);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref().unwrap().len(), 100);
        assert_eq!(chunks[2].choices[0].delta.content.as_deref().unwrap().len(), 100);
        assert_eq!(chunks[3].choices[0].delta.content.as_deref().unwrap().len(), 50);
        let last = chunks.last().unwrap();
        assert!(last.choices[0].delta.content.is_none());
        assert_eq!(last.choices[0].finish_reason, Some("stop"));
    }

    #[test]
    fn sse_frame_is_data_prefixed_and_double_newline_terminated() {
        let frame = sse_frame(&serde_json::json!({"a": 1}));
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
    }
}
