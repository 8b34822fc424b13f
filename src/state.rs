use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::health::HealthState;
use crate::pool::PoolManager;
use crate::prober::Prober;
use crate::rate_limiter::RateLimiter;

/// Process-scoped singletons shared across every connection, mirroring the
/// teacher's `HealthChecker` bundle in `bin/gateway.rs` but generalized to
/// the translation proxy's components.
pub struct AppState {
    pub config: Arc<Config>,
    pub urls: Vec<String>,
    pub health: Arc<HealthState>,
    pub pool: Arc<PoolManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub prober: Arc<Prober>,
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
    pub shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: Config) -> (Self, watch::Receiver<bool>) {
        let config = Arc::new(config);
        let urls = config.upstream_urls();
        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(urls.clone(), health.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.max_requests_per_minute));
        let prober = Arc::new(Prober::new(
            health.clone(),
            Duration::from_secs(config.check_timeout_secs),
            config.max_workers,
            config.test_text.clone(),
            config.test_source_lang.clone(),
            config.test_target_lang.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            health.clone(),
            Duration::from_secs(config.timeout_secs),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        (
            Self {
                config,
                urls,
                health,
                pool,
                rate_limiter,
                prober,
                dispatcher,
                started_at: Instant::now(),
                shutdown_tx,
            },
            shutdown_rx,
        )
    }
}
