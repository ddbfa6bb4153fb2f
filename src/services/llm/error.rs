//! Completer error types

/// Errors surfaced by the completer (LLM oracle)
///
/// The completer is treated as untrusted: every failure mode here is
/// absorbed by the caller as a failed expansion, never a crash.
#[derive(Debug, thiserror::Error)]
pub enum CompleterError {
    #[error("API key not configured")]
    MissingApiKey,

    #[error("completer API error: {0}")]
    Api(String),

    #[error("completer returned empty or unparseable output: {0}")]
    Parse(String),

    #[error("completer timeout after {0}s")]
    Timeout(u64),

    #[error("completer rate limited, retry after {0}s")]
    RateLimited(u64),

    #[error("completer call cancelled")]
    Cancelled,
}

impl CompleterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited(_) | Self::Api(_))
    }
}
