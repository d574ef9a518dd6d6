//! Error types for LLM provider interactions.

/// Errors that can occur when talking to an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    /// Transport-level failure (connection reset, timeout, DNS, ...)
    #[error("HTTP error: {0}")]
    HttpError(String),
    /// Authentication or authorization failure
    #[error("Auth error: {0}")]
    AuthError(String),
    /// Malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// Error reported by the provider itself (throttling, overload, ...)
    #[error("Provider error: {0}")]
    ProviderError(String),
    /// The provider response could not be parsed
    #[error("Response format error: {message}")]
    ResponseFormatError { message: String, raw_response: String },
    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    JsonError(String),
    /// The requested capability is not implemented by this provider
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl LLMError {
    /// Whether a stream error is worth retrying with backoff.
    ///
    /// Matches the retryable signature set used by the executor's stream
    /// recovery: network faults, throttling, and token/context length limits.
    pub fn is_retryable(&self) -> bool {
        let text = self.to_string().to_lowercase();
        const RETRYABLE: &[&str] = &[
            "timeout",
            "timed out",
            "connection",
            "reset by peer",
            "broken pipe",
            "eof",
            "throttl",
            "serviceunav",
            "read timeout",
            "endpoint url",
            "connect timeout",
            "network",
            "socket",
            "aborted",
            "max_tokens",
            "token limit",
            "ran out of tokens",
            "output length",
            "context length",
            "input length",
        ];
        RETRYABLE.iter().any(|kw| text.contains(kw))
    }

    /// Whether the error indicates the request or response hit a length limit.
    pub fn is_length_related(&self) -> bool {
        let text = self.to_string().to_lowercase();
        ["token", "max_tokens", "length limit", "context"]
            .iter()
            .any(|kw| text.contains(kw))
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_signatures() {
        assert!(LLMError::HttpError("connection reset by peer".into()).is_retryable());
        assert!(LLMError::ProviderError("ThrottlingException".into()).is_retryable());
        assert!(LLMError::ProviderError("context length exceeded".into()).is_retryable());
        assert!(!LLMError::AuthError("bad credentials".into()).is_retryable());
        assert!(!LLMError::InvalidRequest("missing field".into()).is_retryable());
    }

    #[test]
    fn length_related() {
        assert!(LLMError::ProviderError("max_tokens reached".into()).is_length_related());
        assert!(!LLMError::HttpError("socket closed".into()).is_length_related());
    }
}
