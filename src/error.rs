//! Error types for the tiller runtime.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session errors
    #[error("Session error: {0}")]
    Session(String),

    /// Session not found
    #[error("Session not found: {key}")]
    SessionNotFound { key: String },

    /// Invalid session key
    #[error("Invalid session key: {0}")]
    InvalidSessionKey(String),

    /// Provider/API errors
    #[error("Provider error: {0}")]
    Provider(String),

    /// The provider reported a context window overflow.
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// Tool execution errors
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Lane scheduling errors
    #[error("Lane error: {0}")]
    Lane(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation aborted by the caller
    #[error("Operation aborted")]
    Aborted,
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a lane error.
    pub fn lane(message: impl Into<String>) -> Self {
        Self::Lane(message.into())
    }
}

// ============================================================================
// Provider error classification
// ============================================================================

/// Classification of an error string observed from an LLM provider.
///
/// Providers differ wildly in how they report failures; the only portable
/// signal is the message text, so classification is substring-based. Only
/// `RateLimit` is retried locally and only `ContextOverflow` triggers the
/// compact-and-retry path; everything else surfaces to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Auth,
    Timeout,
    Billing,
    Format,
    ContextOverflow,
    Unknown,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::Billing => "billing",
            Self::Format => "format",
            Self::ContextOverflow => "context_overflow",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the LLM call should be retried with backoff.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit)
    }
}

/// Classify a provider error message by substring patterns.
pub fn classify_provider_error(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();

    if lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("prompt is too long")
        || lower.contains("maximum context")
        || lower.contains("context_length_exceeded")
        || lower.contains("input is too long")
    {
        return ErrorClass::ContextOverflow;
    }
    if lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("429")
        || lower.contains("overloaded")
    {
        return ErrorClass::RateLimit;
    }
    if lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("invalid x-api-key")
        || lower.contains("authentication")
        || lower.contains("401")
        || lower.contains("403")
    {
        return ErrorClass::Auth;
    }
    if lower.contains("billing")
        || lower.contains("quota")
        || lower.contains("insufficient credit")
        || lower.contains("payment")
    {
        return ErrorClass::Billing;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        return ErrorClass::Timeout;
    }
    if lower.contains("invalid request")
        || lower.contains("malformed")
        || lower.contains("schema")
        || lower.contains("400")
    {
        return ErrorClass::Format;
    }

    ErrorClass::Unknown
}
