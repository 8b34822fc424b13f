use hyper::StatusCode;
use thiserror::Error;

/// Crate-wide error type. Every variant carries enough context to both log
/// and render an HTTP response, mirroring how `UserServiceError`/`ProductServiceError`
/// map onto `jsonrpsee::types::ErrorCode` in the services this proxy replaces.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid model format. Use format: 'model-SOURCE-TARGET' or 'model-TARGET'")]
    InvalidModelFormat,

    #[error("No valid user message found")]
    EmptyText,

    #[error("Text too long (max {max} characters)")]
    TextTooLong { max: usize },

    #[error("Global rate limit exceeded")]
    GlobalRateLimited,

    #[error("Client rate limit exceeded")]
    ClientRateLimited,

    #[error("No available translation endpoints")]
    NoAvailableUpstreams,

    #[error("Translation failed after {attempts} attempts. Last error: {last_error}")]
    UpstreamExhausted { attempts: usize, last_error: String },

    #[error("No valid URLs provided in the environment variable TRANSLATION_API_URLS")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidModelFormat | ProxyError::EmptyText | ProxyError::TextTooLong { .. } => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::GlobalRateLimited | ProxyError::ClientRateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ProxyError::NoAvailableUpstreams | ProxyError::UpstreamExhausted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error `type` tag used in the SSE error frame and JSON error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidModelFormat | ProxyError::EmptyText | ProxyError::TextTooLong { .. } => {
                "invalid_request"
            }
            ProxyError::GlobalRateLimited | ProxyError::ClientRateLimited => "rate_limited",
            ProxyError::NoAvailableUpstreams | ProxyError::UpstreamExhausted { .. } => {
                "translation_error"
            }
            ProxyError::Config(_) | ProxyError::Internal(_) => "internal_error",
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
