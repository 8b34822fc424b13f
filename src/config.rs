use crate::error::ProxyError;
use serde::Deserialize;

fn default_max_requests_per_minute() -> u32 {
    60
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_workers() -> usize {
    5
}
fn default_check_timeout_secs() -> u64 {
    5
}
fn default_check_interval_secs() -> u64 {
    300
}
fn default_initial_check_delay_secs() -> u64 {
    30
}
fn default_max_text_length() -> usize {
    5000
}
fn default_min_available_urls() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_test_text() -> String {
    "Hello, world".to_string()
}
fn default_test_source_lang() -> String {
    "EN".to_string()
}
fn default_test_target_lang() -> String {
    "ZH".to_string()
}
fn default_export_path() -> String {
    "./results/useful.txt".to_string()
}
fn default_result_format() -> String {
    "detailed".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Typed, validated process configuration. Loaded once at startup via the
/// `config` crate's environment source and never mutated afterward.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub translation_api_urls: String,

    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_initial_check_delay_secs")]
    pub initial_check_delay_secs: u64,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_min_available_urls")]
    pub min_available_urls: usize,
    #[serde(default = "default_true")]
    pub auto_update_urls: bool,
    #[serde(default = "default_true")]
    pub enable_streaming: bool,
    #[serde(default = "default_test_text")]
    pub test_text: String,
    #[serde(default = "default_test_source_lang")]
    pub test_source_lang: String,
    #[serde(default = "default_test_target_lang")]
    pub test_target_lang: String,
    #[serde(default = "default_export_path")]
    pub export_path: String,
    #[serde(default = "default_result_format")]
    pub result_format: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    /// Parses `TRANSLATION_API_URLS` into a trimmed, non-empty list of upstreams.
    pub fn upstream_urls(&self) -> Vec<String> {
        self.translation_api_urls
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Loads configuration from the process environment. Fails fast, mirroring
    /// the original's `raise ValueError(...)` at import time when no URLs are set.
    pub fn from_env() -> Result<Self, ProxyError> {
        let builder = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        let cfg: Self = builder
            .try_deserialize()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        if cfg.upstream_urls().is_empty() {
            return Err(ProxyError::Config(
                "No valid URLs provided in the environment variable TRANSLATION_API_URLS"
                    .to_string(),
            ));
        }

        Ok(cfg)
    }
}
