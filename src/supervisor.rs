use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::export::check_and_export;
use crate::health::HealthState;
use crate::pool::PoolManager;
use crate::prober::Prober;

const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const NORMAL_FAILURE_DELAY: Duration = Duration::from_secs(60);

pub struct SupervisorConfig {
    pub check_interval: Duration,
    pub initial_check_delay: Duration,
    pub auto_update_urls: bool,
    pub min_available_urls: usize,
    pub export_path: String,
    pub result_format: String,
}

/// Periodic, adaptive-interval background probe loop bound to the process
/// lifecycle. Re-invokes the same sweep-and-export logic the HTTP route uses.
pub struct Supervisor {
    prober: Arc<Prober>,
    pool: Arc<PoolManager>,
    health: Arc<HealthState>,
    urls: Vec<String>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        prober: Arc<Prober>,
        pool: Arc<PoolManager>,
        health: Arc<HealthState>,
        urls: Vec<String>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            prober,
            pool,
            health,
            urls,
            config,
        }
    }

    /// Runs until `shutdown` fires. Returns only on cancellation.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting periodic URL checker (interval: {:?})",
            self.config.check_interval
        );

        if sleep_or_cancel(self.config.initial_check_delay, &mut shutdown).await {
            return;
        }

        let mut consecutive_failures: u32 = 0;

        loop {
            let pool = Arc::clone(&self.pool);
            let prober = Arc::clone(&self.prober);
            let urls = self.urls.clone();
            let export_path = self.config.export_path.clone();
            let result_format = self.config.result_format.clone();
            let auto_update_urls = self.config.auto_update_urls;
            let min_available_urls = self.config.min_available_urls;

            let sweep = tokio::spawn(async move {
                check_and_export(
                    &prober,
                    &pool,
                    &urls,
                    &export_path,
                    &result_format,
                    auto_update_urls,
                    min_available_urls,
                )
                .await
            })
            .await;

            let interval = match sweep {
                Ok(report) => {
                    if report.urls_updated {
                        info!("URLs auto-updated: {} active URLs", report.summary.available);
                    }
                    consecutive_failures = 0;
                    self.next_interval().await
                }
                Err(join_err) => {
                    error!("Error in periodic URL check: {join_err}");
                    consecutive_failures += 1;
                    if failure_backoff(&mut consecutive_failures, self.config.check_interval, &mut shutdown)
                        .await
                    {
                        info!("Periodic URL check cancelled");
                        return;
                    }
                    continue;
                }
            };

            if sleep_or_cancel(interval, &mut shutdown).await {
                info!("Periodic URL check cancelled");
                return;
            }
        }
    }

    /// Shortens the interval when fewer than half the configured upstreams
    /// are currently marked available.
    async fn next_interval(&self) -> Duration {
        let snapshot = self.health.snapshot().await;
        let total = self.urls.len().max(1);
        let available_count = self
            .urls
            .iter()
            .filter(|u| snapshot.get(*u).map(|r| r.available).unwrap_or(false))
            .count();

        if available_count * 2 < total {
            let shortened = (self.config.check_interval / 2).min(Duration::from_secs(120));
            info!(
                "Low availability detected ({available_count}/{total}), using shorter interval: {shortened:?}"
            );
            shortened
        } else {
            self.config.check_interval
        }
    }
}

/// Sleeps for `duration` unless a shutdown signal arrives first. Returns
/// `true` if cancelled.
async fn sleep_or_cancel(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}

/// Records a failed supervisor pass for the backoff schedule: standard 60s
/// delay, or `2 * check_interval` with the counter reset after 5 in a row.
/// Returns `true` if cancelled mid-sleep.
async fn failure_backoff(
    consecutive_failures: &mut u32,
    check_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
        error!(
            "Too many consecutive failures ({consecutive_failures}), extending sleep time"
        );
        let cancelled = sleep_or_cancel(check_interval * 2, shutdown).await;
        *consecutive_failures = 0;
        cancelled
    } else {
        sleep_or_cancel(NORMAL_FAILURE_DELAY, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn supervisor_stops_promptly_on_shutdown_during_initial_delay() {
        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![], health.clone()));
        let prober = Arc::new(Prober::new(
            health.clone(),
            Duration::from_secs(1),
            5,
            "Hello".to_string(),
            "EN".to_string(),
            "ZH".to_string(),
        ));
        let config = SupervisorConfig {
            check_interval: Duration::from_secs(300),
            initial_check_delay: Duration::from_secs(3600),
            auto_update_urls: false,
            min_available_urls: 2,
            export_path: std::env::temp_dir()
                .join(format!("translingo-test-{}.txt", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .to_string(),
            result_format: "detailed".to_string(),
        };
        let supervisor = Supervisor::new(prober, pool, health, vec![], config);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("supervisor should stop promptly on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn supervisor_runs_one_pass_and_updates_pool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "x"})))
            .mount(&server)
            .await;

        let health = Arc::new(HealthState::new());
        let pool = Arc::new(PoolManager::new(vec![server.uri()], health.clone()));
        let prober = Arc::new(Prober::new(
            health.clone(),
            Duration::from_secs(2),
            5,
            "Hello".to_string(),
            "EN".to_string(),
            "ZH".to_string(),
        ));
        let export_path = std::env::temp_dir()
            .join(format!("translingo-test-{}.txt", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        let config = SupervisorConfig {
            check_interval: Duration::from_secs(300),
            initial_check_delay: Duration::from_millis(1),
            auto_update_urls: true,
            min_available_urls: 1,
            export_path,
            result_format: "detailed".to_string(),
        };
        let supervisor = Supervisor::new(prober, pool.clone(), health, vec![server.uri()], config);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.urls().await, vec![server.uri()]);
    }

    #[tokio::test]
    async fn failure_backoff_resets_counter_after_threshold() {
        let (_tx, mut rx) = watch::channel(false);
        let mut failures = MAX_CONSECUTIVE_FAILURES;
        let cancelled = failure_backoff(&mut failures, Duration::from_millis(1), &mut rx).await;
        assert!(!cancelled);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn failure_backoff_below_threshold_leaves_counter_unchanged() {
        let (tx, mut rx) = watch::channel(false);
        let mut failures = MAX_CONSECUTIVE_FAILURES - 1;
        tx.send(true).unwrap();
        let cancelled = failure_backoff(&mut failures, Duration::from_millis(1), &mut rx).await;
        assert!(cancelled);
        assert_eq!(failures, MAX_CONSECUTIVE_FAILURES - 1);
    }
}
