use triage_providers::ProviderError;
use triage_tools::ToolSchemaValidationError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// User-initiated; callers may treat this as "no answer" rather than a failure.
    #[error("cancelled")]
    Cancelled,
    #[error(
        "the model provider is still rate limiting after {attempts} attempt(s): {message}. \
         Wait a moment before retrying or lower the request rate in the throttle settings."
    )]
    RateLimitExhausted { attempts: usize, message: String },
    #[error("model request failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: ProviderError,
    },
    #[error("model request failed on attempt {attempt}: {source}")]
    NonRetryable {
        attempt: usize,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    InvalidToolSchema(#[from] ToolSchemaValidationError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short machine-readable code used in observability events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cancelled => "CANCELLED",
            Self::RateLimitExhausted { .. } => "RATE_LIMIT_EXCEEDED",
            Self::RetriesExhausted { .. } => "PROVIDER_RETRIES_EXHAUSTED",
            Self::NonRetryable { .. } => "PROVIDER_REQUEST_FAILED",
            Self::InvalidToolSchema(_) => "TOOL_SCHEMA_INVALID",
            Self::Internal(_) => "INTERNAL",
        }
    }
}
