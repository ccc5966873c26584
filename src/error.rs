use thiserror::Error;

/// Failures surfaced by the OAuth flow, the credential lifecycle and the
/// calendar adapter. Each request fails independently; none of these are
/// fatal to the process.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("authorization state mismatch: {0}")]
    AuthStateMismatch(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Validation(String),
    #[error("calendar service returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("request to {service} timed out")]
    Timeout { service: &'static str },
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BookingError {
    pub fn not_authorized() -> Self {
        Self::Unauthorized("User not authorized. Visit /authorize first.".to_owned())
    }

    /// True for failures the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}
