use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use translingo_proxy::boundary;
use translingo_proxy::config::Config;
use translingo_proxy::dispatcher::{self, SSE_DONE};
use translingo_proxy::error::ProxyError;
use translingo_proxy::export;
use translingo_proxy::state::AppState;
use translingo_proxy::supervisor::{Supervisor, SupervisorConfig};
use translingo_proxy::wire::ChatCompletionRequest;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const AVAILABILITY_WINDOW_SECS: f64 = 300.0;

fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn full_body<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: StatusCode, value: &Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(value.to_string()))
        .expect("response with well-formed headers always builds")
}

fn with_common_headers(
    mut response: Response<BoxBody>,
    request_id: &str,
) -> Response<BoxBody> {
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    headers.insert("X-Request-ID", request_id.parse().unwrap());
    response
}

fn error_response(request_id: &str, err: &ProxyError) -> Response<BoxBody> {
    let body = json!({ "detail": err.to_string() });
    with_common_headers(json_response(err.status_code(), &body), request_id)
}

async fn handle_chat_completions(
    state: &AppState,
    client_ip: &str,
    request_id: &str,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, ProxyError> {
    let accept_header = req
        .headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body_bytes = req
        .collect()
        .await
        .map_err(|e| ProxyError::Internal(anyhow::anyhow!("failed to read request body: {e}")))?
        .to_bytes();
    let chat_request: ChatCompletionRequest = serde_json::from_slice(&body_bytes)
        .map_err(|e| ProxyError::Internal(anyhow::anyhow!("invalid request body: {e}")))?;

    state.rate_limiter.acquire(Some(client_ip)).await.map_err(|e| {
        warn!("[{request_id}] {e}");
        e
    })?;

    let (source_lang, target_lang) = boundary::parse_model(&chat_request.model)?;

    let text = boundary::extract_user_text(&chat_request.messages)
        .filter(|t| !t.trim().is_empty())
        .ok_or(ProxyError::EmptyText)?;

    if text.chars().count() > state.config.max_text_length {
        return Err(ProxyError::TextTooLong {
            max: state.config.max_text_length,
        });
    }

    info!(
        "[{request_id}] Translating {} chars: {} -> {target_lang}",
        text.chars().count(),
        if source_lang.is_empty() { "AUTO" } else { source_lang.as_str() }
    );

    let use_streaming = chat_request.stream
        && boundary::wants_streaming(state.config.enable_streaming, accept_header.as_deref());

    if use_streaming {
        Ok(stream_translation(
            state,
            request_id,
            chat_request.model.clone(),
            text,
            source_lang,
            target_lang,
        ))
    } else {
        let translated = state
            .dispatcher
            .translate(&text, &source_lang, &target_lang)
            .await?;
        let envelope =
            dispatcher::build_completion_response(&chat_request.model, &text, &translated);
        let body = serde_json::to_value(&envelope).expect("response envelope always serializes");
        Ok(json_response(StatusCode::OK, &body))
    }
}

/// Spawns the buffered translate-then-chunk pipeline and wires its output to
/// an SSE body, matching the original's `sse_translate` generator: the whole
/// translation happens before the first chunk is emitted.
fn stream_translation(
    state: &AppState,
    request_id: &str,
    model: String,
    text: String,
    source_lang: String,
    target_lang: String,
) -> Response<BoxBody> {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let dispatcher = Arc::clone(&state.dispatcher);
    let request_id = request_id.to_string();

    tokio::spawn(async move {
        match dispatcher.translate(&text, &source_lang, &target_lang).await {
            Ok(translated) => {
                let message_id = uuid::Uuid::new_v4().to_string();
                let created = Utc::now().timestamp();
                let chunks =
                    dispatcher::build_stream_chunks(&message_id, &model, created, &translated);
                for chunk in chunks {
                    let frame = dispatcher::sse_frame(&chunk);
                    if tx.send(Bytes::from(frame)).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(dispatcher::stream_chunk_pause()).await;
                }
            }
            Err(err) => {
                error!("[{request_id}] Streaming translation failed: {err}");
                let _ = tx.send(Bytes::from(dispatcher::sse_error_frame(&err))).await;
            }
        }
        let _ = tx.send(Bytes::from(SSE_DONE)).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok::<_, hyper::Error>(Frame::data(bytes)), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(StreamBody::new(stream).boxed())
        .expect("streaming response with well-formed headers always builds")
}

async fn handle_check_and_export(state: &AppState) -> Response<BoxBody> {
    if state.urls.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "No URLs found in environment variables" }),
        );
    }

    info!("Starting URL check for {} URLs", state.urls.len());
    let report = export::check_and_export(
        &state.prober,
        &state.pool,
        &state.urls,
        &state.config.export_path,
        &state.config.result_format,
        state.config.auto_update_urls,
        state.config.min_available_urls,
    )
    .await;

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let mut body = json!({
        "status": "success",
        "message": "URLs checked and exported successfully",
        "timestamp": timestamp,
        "summary": report.summary,
        "available_urls": report.available_urls,
        "unavailable_urls": report.unavailable_urls,
        "export_path": report.export_path,
        "file_written": report.file_written,
        "urls_updated": report.urls_updated,
    });

    let latencies: Vec<f64> = report
        .available_urls
        .iter()
        .filter_map(|u| u.latency)
        .collect();
    if !latencies.is_empty() {
        let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let min = latencies.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        body["performance"] = json!({
            "avg_latency": (avg * 1000.0).round() / 1000.0,
            "min_latency": (min * 1000.0).round() / 1000.0,
            "max_latency": (max * 1000.0).round() / 1000.0,
        });
    }

    json_response(StatusCode::OK, &body)
}

async fn handle_urls_status(state: &AppState) -> Response<BoxBody> {
    let snapshot = state.health.snapshot().await;
    let now = Utc::now().timestamp() as f64;
    let request_counts = state.pool.request_counts().await;

    let mut urls_status = serde_json::Map::new();
    let mut available_count = 0usize;

    for url in &state.urls {
        let record = snapshot.get(url).cloned().unwrap_or_default();
        let seconds_since_success = record.seconds_since_success(now);
        if let Some(secs) = seconds_since_success {
            if secs < AVAILABILITY_WINDOW_SECS {
                available_count += 1;
            }
        }

        urls_status.insert(
            url.clone(),
            json!({
                "available": record.available,
                "latency": record.latency_seconds,
                "response_length": record.response_length_bytes,
                "last_check": record.last_check_epoch,
                "last_success": record.last_success_epoch,
                "seconds_since_check": record.last_check_epoch.map(|t| (now - t) as i64),
                "seconds_since_success": seconds_since_success.map(|s| s as i64),
                "consecutive_failures": record.consecutive_failures,
                "total_checks": record.total_checks,
                "success_rate": record.success_rate,
                "health_score": record.health_score(),
            }),
        );
    }

    let body = json!({
        "status": if available_count > 0 { "healthy" } else { "degraded" },
        "timestamp": chrono::Local::now().to_rfc3339(),
        "summary": {
            "total_urls": state.urls.len(),
            "available_urls": available_count,
            "degraded_urls": state.urls.len().saturating_sub(available_count),
            "avg_latency": Value::Null,
        },
        "urls_status": urls_status,
        "request_stats": {
            "total_requests": request_counts.values().sum::<u64>(),
            "request_distribution": request_counts,
        },
    });

    json_response(StatusCode::OK, &body)
}

async fn handle_health(state: &AppState) -> Response<BoxBody> {
    let snapshot = state.health.snapshot().await;
    let now = Utc::now().timestamp() as f64;

    let mut available_urls = 0usize;
    let mut recent_failures = 0usize;
    for url in &state.urls {
        let record = snapshot.get(url);
        match record {
            Some(r) if r.available && r.seconds_since_success(now).map(|s| s < AVAILABILITY_WINDOW_SECS).unwrap_or(false) => {
                available_urls += 1;
            }
            Some(r) if r.consecutive_failures > 0 => {
                recent_failures += 1;
            }
            _ => {}
        }
    }

    let total = state.urls.len();
    let (status, status_code) = if available_urls == 0 {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if total > 0 && (available_urls as f64) < (total as f64) * 0.5 {
        ("degraded", StatusCode::OK)
    } else {
        ("healthy", StatusCode::OK)
    };

    let total_requests: u64 = state.pool.request_counts().await.values().sum();
    let latencies: Vec<f64> = snapshot.values().filter_map(|r| r.latency_seconds).collect();
    let avg_response_time = if latencies.is_empty() {
        Value::Null
    } else {
        json!((latencies.iter().sum::<f64>() / latencies.len() as f64 * 1000.0).round() / 1000.0)
    };

    let mut body = json!({
        "status": status,
        "timestamp": chrono::Local::now().to_rfc3339(),
        "service_info": {
            "version": "1.1.0",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "total_requests_processed": total_requests,
        },
        "endpoints": {
            "total_configured": total,
            "currently_available": available_urls,
            "recently_failed": recent_failures,
            "availability_percentage": if total > 0 {
                json!((available_urls as f64 / total as f64 * 1000.0).round() / 10.0)
            } else {
                json!(0)
            },
        },
        "performance": {
            "avg_response_time": avg_response_time,
            "rate_limit_status": "normal",
        },
    });

    if state.config.debug {
        let detailed: serde_json::Map<String, Value> = snapshot
            .iter()
            .map(|(url, v)| {
                (
                    url.clone(),
                    json!({
                        "available": v.available,
                        "latency": v.latency_seconds,
                        "consecutive_failures": v.consecutive_failures,
                        "total_checks": v.total_checks,
                        "success_rate": v.success_rate,
                    }),
                )
            })
            .collect();
        body["detailed_status"] = Value::Object(detailed);
    }

    json_response(status_code, &body)
}

fn handle_models() -> Response<BoxBody> {
    const PAIRS: &[&str] = &[
        "EN-ZH", "EN-JA", "EN-FR", "EN-DE", "EN-ES", "ZH-EN", "JA-EN", "FR-EN", "DE-EN", "ES-EN",
    ];
    const SINGLE: &[&str] = &["ZH", "EN", "JA"];

    let mut models: Vec<Value> = PAIRS
        .iter()
        .map(|pair| {
            json!({
                "id": format!("deepl-{pair}"),
                "object": "model",
                "created": 1_677_610_602,
                "owned_by": "deepl",
            })
        })
        .collect();
    models.extend(SINGLE.iter().map(|lang| {
        json!({
            "id": format!("deepl-{lang}"),
            "object": "model",
            "created": 1_677_610_602,
            "owned_by": "deepl",
        })
    }));

    json_response(StatusCode::OK, &json!({ "object": "list", "data": models }))
}

fn handle_root() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "service": "DeepLX Translation API",
            "version": "1.1.0",
            "status": "running",
            "endpoints": {
                "translate": "/v1/chat/completions",
                "health": "/health",
                "check_urls": "/v1/check-and-export-urls",
                "url_status": "/v1/urls/status",
                "models": "/v1/models",
            },
        }),
    )
}

async fn handle_request(
    state: Arc<AppState>,
    client_ip: String,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    let start = Instant::now();
    let request_id = boundary::new_request_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(empty_body())
            .expect("preflight response always builds");
        return Ok(with_common_headers(response, &request_id));
    }

    let result = match (method.as_str(), path.as_str()) {
        ("POST", "/v1/chat/completions") => {
            handle_chat_completions(&state, &client_ip, &request_id, req).await
        }
        ("POST", "/v1/check-and-export-urls") => {
            Ok(handle_check_and_export(&state).await)
        }
        ("GET", "/v1/urls/status") => Ok(handle_urls_status(&state).await),
        ("GET", "/health") => Ok(handle_health(&state).await),
        ("GET", "/v1/models") => Ok(handle_models()),
        ("GET", "/") => Ok(handle_root()),
        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &json!({ "detail": "Not Found" }),
        )),
    };

    let response = match result {
        Ok(response) => response,
        Err(err) => error_response(&request_id, &err),
    };

    let duration = start.elapsed();
    info!(
        "[{request_id}] {method} {path} -> {} in {:.3}s",
        response.status(),
        duration.as_secs_f64()
    );

    Ok(with_common_headers(response, &request_id))
}

fn init_tracing(config: &Config) {
    let filter = config
        .log_level
        .clone()
        .unwrap_or_else(|| if config.debug { "debug".to_string() } else { "info".to_string() });
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;
    init_tracing(&config);

    info!("Starting translingo-proxy...");

    let (state, shutdown_rx) = AppState::new(config);
    let state = Arc::new(state);

    let supervisor = Supervisor::new(
        state.prober.clone(),
        state.pool.clone(),
        state.health.clone(),
        state.urls.clone(),
        SupervisorConfig {
            check_interval: Duration::from_secs(state.config.check_interval_secs),
            initial_check_delay: Duration::from_secs(state.config.initial_check_delay_secs),
            auto_update_urls: state.config.auto_update_urls,
            min_available_urls: state.config.min_available_urls,
            export_path: state.config.export_path.clone(),
            result_format: state.config.result_format.clone(),
        },
    );
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("translingo-proxy listening on http://{addr}");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                let client_ip = peer.ip().to_string();

                tokio::spawn(async move {
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| handle_request(Arc::clone(&state), client_ip.clone(), req)),
                        )
                        .await
                    {
                        error!("Error serving connection: {err:?}");
                    }
                });
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping supervisor and listener");
                let _ = state.shutdown_tx.send(true);
                break;
            }
        }
    }

    let _ = supervisor_handle.await;
    info!("translingo-proxy stopped");
    Ok(())
}
