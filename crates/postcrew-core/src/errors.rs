use std::time::Duration;

/// Typed failure of an agent invocation or of the services behind it.
/// Classifies errors as retryable (transport level) or terminal.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum InvocationError {
    // Terminal
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed output from {agent}: {detail}")]
    MalformedOutput { agent: String, detail: String },
    #[error("service not configured: {0}")]
    Unavailable(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl InvocationError {
    pub fn malformed(agent: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedOutput {
            agent: agent.into(),
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Server { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(InvocationError::RateLimited { retry_after: None }.is_retryable());
        assert!(InvocationError::Server { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(InvocationError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(!InvocationError::Authentication("bad key".into()).is_retryable());
        assert!(!InvocationError::malformed("critic", "not json").is_retryable());
        assert!(!InvocationError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!InvocationError::Unavailable("search".into()).is_retryable());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = InvocationError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(InvocationError::Network("x".into()).suggested_delay(), None);
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            InvocationError::from_status(401, "unauthorized".into()),
            InvocationError::Authentication(_)
        ));
        assert!(matches!(
            InvocationError::from_status(400, "bad".into()),
            InvocationError::InvalidRequest(_)
        ));
        assert!(InvocationError::from_status(429, "slow down".into()).is_retryable());
        assert!(InvocationError::from_status(503, "unavailable".into()).is_retryable());
    }

    #[test]
    fn malformed_message_names_agent() {
        let err = InvocationError::malformed("evaluator", "score missing");
        assert_eq!(err.to_string(), "malformed output from evaluator: score missing");
        assert_eq!(err.error_kind(), "malformed_output");
    }
}
