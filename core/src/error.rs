//! Error taxonomy shared across every subsystem (spec §7).
//!
//! Every stage boundary in the orchestrator classifies whatever failed into
//! one of these kinds before deciding whether to retry, degrade, or abort.

use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

/// The nine error kinds from spec §7. `Cancelled` is not really an error
/// against the campaign — it short-circuits work cooperatively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Transient,
    RateLimited,
    QuotaExceeded,
    Auth,
    Parse,
    LowPersonalization,
    Permanent,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::Auth => "auth",
            ErrorKind::Parse => "parse",
            ErrorKind::LowPersonalization => "low_personalization",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
pub enum AppError {
    Config(String),
    Transient(String),
    RateLimited { retry_after: Option<std::time::Duration> },
    RateLimitTimeout,
    QuotaExceeded(String),
    Auth(String),
    Parse(String),
    LowPersonalization { body: String, score: f32 },
    Permanent(String),
    Cancelled,
    Internal(anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) => ErrorKind::Config,
            AppError::Transient(_) => ErrorKind::Transient,
            AppError::RateLimited { .. } | AppError::RateLimitTimeout => ErrorKind::RateLimited,
            AppError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            AppError::Auth(_) => ErrorKind::Auth,
            AppError::Parse(_) => ErrorKind::Parse,
            AppError::LowPersonalization { .. } => ErrorKind::LowPersonalization,
            AppError::Permanent(_) => ErrorKind::Permanent,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::Internal(_) => ErrorKind::Permanent,
        }
    }

    /// Whether the stage retry loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::RateLimited
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(m) => write!(f, "config error: {m}"),
            AppError::Transient(m) => write!(f, "transient error: {m}"),
            AppError::RateLimited { retry_after } => {
                write!(f, "rate limited, retry_after={retry_after:?}")
            }
            AppError::RateLimitTimeout => write!(f, "rate limit acquire timed out"),
            AppError::QuotaExceeded(m) => write!(f, "quota exceeded: {m}"),
            AppError::Auth(m) => write!(f, "auth error: {m}"),
            AppError::Parse(m) => write!(f, "parse error: {m}"),
            AppError::LowPersonalization { score, .. } => {
                write!(f, "low personalization score: {score}")
            }
            AppError::Permanent(m) => write!(f, "permanent error: {m}"),
            AppError::Cancelled => write!(f, "cancelled"),
            AppError::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return AppError::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 => AppError::RateLimited { retry_after: None },
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                AppError::Auth(e.to_string())
            }
            Some(status) if status.is_server_error() || status.as_u16() == 408 => {
                AppError::Transient(e.to_string())
            }
            Some(_) => AppError::Permanent(e.to_string()),
            None => AppError::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AppError::Transient("deadline elapsed".into())
    }
}
