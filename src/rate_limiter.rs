use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::error::ProxyError;

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

struct Windows {
    global: Vec<f64>,
    per_client: HashMap<String, Vec<f64>>,
}

/// Dual sliding-window admission control: a global window and a stricter
/// per-client window, both purged and checked under one lock to avoid
/// a check-then-append race between concurrent requests.
pub struct RateLimiter {
    max_requests_per_minute: u32,
    time_window_secs: f64,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        Self::with_window(max_requests_per_minute, 60.0)
    }

    pub fn with_window(max_requests_per_minute: u32, time_window_secs: f64) -> Self {
        Self {
            max_requests_per_minute,
            time_window_secs,
            windows: Mutex::new(Windows {
                global: Vec::new(),
                per_client: HashMap::new(),
            }),
        }
    }

    fn per_client_limit(&self) -> u32 {
        (self.max_requests_per_minute / 4).min(30)
    }

    /// Admits or rejects a request. Global check first, then per-client;
    /// both windows are purged before either check. On acceptance, both
    /// windows receive the current timestamp.
    pub async fn acquire(&self, client_ip: Option<&str>) -> Result<(), ProxyError> {
        let now = now_epoch();
        let mut windows = self.windows.lock().await;

        windows
            .global
            .retain(|t| now - *t < self.time_window_secs);
        if windows.global.len() as u32 >= self.max_requests_per_minute {
            return Err(ProxyError::GlobalRateLimited);
        }

        if let Some(ip) = client_ip {
            let client_limit = self.per_client_limit();
            let entry = windows.per_client.entry(ip.to_string()).or_default();
            entry.retain(|t| now - *t < self.time_window_secs);
            if entry.len() as u32 >= client_limit {
                return Err(ProxyError::ClientRateLimited);
            }
            entry.push(now);
        }

        windows.global.push(now);
        Ok(())
    }
}
