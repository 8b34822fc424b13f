use std::path::Path;

use chrono::Local;
use serde::Serialize;
use tracing::{error, warn};

use crate::pool::PoolManager;
use crate::prober::{Prober, ProbeResult};

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub total_checked: usize,
    pub available: usize,
    pub unavailable: usize,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckExportReport {
    pub summary: SweepSummary,
    pub available_urls: Vec<ProbeSummaryEntry>,
    pub unavailable_urls: Vec<ProbeSummaryEntry>,
    pub export_path: String,
    pub file_written: bool,
    pub urls_updated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeSummaryEntry {
    pub url: String,
    pub available: bool,
    pub latency: Option<f64>,
    pub error: Option<String>,
    pub response_length: Option<usize>,
}

impl From<&ProbeResult> for ProbeSummaryEntry {
    fn from(r: &ProbeResult) -> Self {
        Self {
            url: r.url.clone(),
            available: r.available,
            latency: r.latency_seconds,
            error: r.error.clone(),
            response_length: r.response_length_bytes,
        }
    }
}

/// Runs a full probe sweep over `urls`, writes a human-readable report to
/// `export_path`, and — if `auto_update` is set and enough URLs are healthy —
/// replaces the active pool with the available ones. Shared by the
/// `/v1/check-and-export-urls` route and the periodic supervisor, matching
/// the original's periodic task literally re-invoking the HTTP handler.
pub async fn check_and_export(
    prober: &Prober,
    pool: &PoolManager,
    urls: &[String],
    export_path: &str,
    result_format: &str,
    auto_update: bool,
    min_available_urls: usize,
) -> CheckExportReport {
    let results = prober.probe_many(urls).await;

    let available: Vec<&ProbeResult> = results.iter().filter(|r| r.available).collect();
    let unavailable: Vec<&ProbeResult> = results.iter().filter(|r| !r.available).collect();

    let success_rate = if urls.is_empty() {
        0.0
    } else {
        available.len() as f64 / urls.len() as f64 * 100.0
    };

    let report_text = format_report(result_format, urls.len(), &available, &unavailable);
    let file_written = write_report(export_path, &report_text);

    let mut urls_updated = false;
    if auto_update && available.len() >= min_available_urls {
        let new_urls: Vec<String> = available.iter().map(|r| r.url.clone()).collect();
        pool.replace_urls(new_urls).await;
        urls_updated = true;
    } else if auto_update {
        warn!(
            "Not enough available URLs ({}) for auto-update (min: {})",
            available.len(),
            min_available_urls
        );
    }

    CheckExportReport {
        summary: SweepSummary {
            total_checked: urls.len(),
            available: available.len(),
            unavailable: unavailable.len(),
            success_rate,
        },
        available_urls: available.iter().map(|r| ProbeSummaryEntry::from(*r)).collect(),
        unavailable_urls: unavailable
            .iter()
            .take(10)
            .map(|r| ProbeSummaryEntry::from(*r))
            .collect(),
        export_path: export_path.to_string(),
        file_written,
        urls_updated,
    }
}

fn format_report(
    format: &str,
    total: usize,
    available: &[&ProbeResult],
    unavailable: &[&ProbeResult],
) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    if format == "compact" {
        let endpoints: Vec<&str> = available.iter().map(|r| r.url.as_str()).collect();
        return format!(
            "\n{timestamp}\nDeepLX: ({}/{}) {}\n",
            available.len(),
            total,
            endpoints.join(", ")
        );
    }

    let mut out = String::new();
    out.push_str(&format!("DeepLX URL Check Report - {timestamp}\n"));
    out.push_str(&"=".repeat(80));
    out.push_str("\n\n");
    out.push_str("Summary:\n");
    out.push_str(&format!("  Total URLs checked: {total}\n"));
    out.push_str(&format!("  Available URLs: {}\n", available.len()));
    out.push_str(&format!("  Unavailable URLs: {}\n", unavailable.len()));
    let rate = if total > 0 {
        available.len() as f64 / total as f64 * 100.0
    } else {
        0.0
    };
    out.push_str(&format!("  Success rate: {rate:.1}%\n\n"));

    if !available.is_empty() {
        out.push_str("Available endpoints (sorted by latency):\n");
        out.push_str(&"-".repeat(60));
        out.push('\n');
        for (i, r) in available.iter().enumerate() {
            let latency = r.latency_seconds.unwrap_or(0.0);
            let len = r.response_length_bytes.unwrap_or(0);
            out.push_str(&format!("{:2}. ({latency:.3}s, {len}B) {}\n", i + 1, r.url));
        }
        out.push_str(&"-".repeat(60));
        out.push_str("\n\n");
    }

    if !unavailable.is_empty() {
        out.push_str("Unavailable endpoints:\n");
        out.push_str(&"-".repeat(60));
        out.push('\n');
        for (i, r) in unavailable.iter().enumerate() {
            let error = r.error.as_deref().unwrap_or("Unknown error");
            let short: String = error.chars().take(50).collect();
            out.push_str(&format!("{:2}. {}\n      Error: {short}\n", i + 1, r.url));
        }
        out.push_str(&"-".repeat(60));
        out.push_str("\n\n");
    }

    if !available.is_empty() {
        let latencies: Vec<f64> = available.iter().filter_map(|r| r.latency_seconds).collect();
        if !latencies.is_empty() {
            let avg = latencies.iter().sum::<f64>() / latencies.len() as f64;
            let min = latencies.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = latencies.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            out.push_str("Performance statistics:\n");
            out.push_str(&format!("  Average latency: {avg:.3}s\n"));
            out.push_str(&format!("  Best latency: {min:.3}s\n"));
            out.push_str(&format!("  Worst latency: {max:.3}s\n\n"));
        }
    }

    out
}

fn write_report(export_path: &str, text: &str) -> bool {
    let path = Path::new(export_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("Error creating directory for {export_path}: {e}");
                return false;
            }
        }
    }
    match std::fs::write(path, text) {
        Ok(()) => true,
        Err(e) => {
            error!("Error writing to file {export_path}: {e}");
            false
        }
    }
}
