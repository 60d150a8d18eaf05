use std::time::Duration;

/// Why a model call produced no usable text. Each variant maps to a stable
/// `error_kind` string carried on failure signals.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("provider rejected credentials: {0}")]
    AuthenticationFailed(String),
    #[error("provider rejected request: {0}")]
    InvalidRequest(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider returned {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("could not reach provider: {0}")]
    NetworkError(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("unreadable provider response: {0}")]
    MalformedResponse(String),
    #[error("no endpoint configured for provider '{0}'")]
    UnknownProvider(String),
}

impl InvokeError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::MalformedResponse(_) => "malformed_response",
            Self::UnknownProvider(_) => "unknown_provider",
        }
    }

    /// Map a non-success HTTP status. Anything unexpected counts as a bad request.
    pub fn from_status(status: u16, body: String) -> Self {
        if status >= 500 {
            return Self::ServerError { status, body };
        }
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            429 => Self::RateLimited { retry_after: None },
            400 | 404 | 422 => Self::InvalidRequest(body),
            other => Self::InvalidRequest(format!("HTTP {other}: {body}")),
        }
    }
}
