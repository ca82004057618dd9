use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Broad category of a [`ThrottleError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied a malformed key, token count, limit or setting.
    Validation,
    /// The bucket for a key is exhausted.
    RateLimit,
    /// The store failed or is no longer available.
    Backend,
    /// The caller's deadline passed.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Backend => "backend",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("{message}: field={field}, value={value}")]
    Validation {
        field: String,
        value: String,
        message: String,
    },

    #[error("rate limit exceeded: key={key}, limit={limit}, reset={}", .reset.to_rfc3339())]
    RateLimitExceeded {
        key: String,
        limit: i64,
        reset: DateTime<Utc>,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("key capacity reached: max_keys={max_keys}")]
    KeyLimitReached { max_keys: usize },

    #[error("{message}: {source}")]
    Backend {
        message: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("operation timed out: timeout={timeout:?}")]
    Timeout { timeout: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ThrottleError>,
    },
}

pub type Result<T> = std::result::Result<T, ThrottleError>;

impl ThrottleError {
    pub fn validation(
        field: impl Into<String>,
        value: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        ThrottleError::Validation {
            field: field.into(),
            value: value.to_string(),
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>, source: redis::RedisError) -> Self {
        ThrottleError::Backend {
            message: message.into(),
            source,
        }
    }

    /// Wraps the error with a description of the failed step. The kind is preserved.
    pub fn context(self, context: impl Into<String>) -> Self {
        ThrottleError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ThrottleError::Validation { .. } | ThrottleError::Config(_) => ErrorKind::Validation,
            ThrottleError::RateLimitExceeded { .. } => ErrorKind::RateLimit,
            ThrottleError::Unavailable(_)
            | ThrottleError::KeyLimitReached { .. }
            | ThrottleError::Backend { .. } => ErrorKind::Backend,
            ThrottleError::Timeout { .. } => ErrorKind::Timeout,
            ThrottleError::Cancelled => ErrorKind::Cancelled,
            ThrottleError::Context { source, .. } => source.kind(),
        }
    }

    /// Innermost error, with every context layer stripped.
    pub fn root(&self) -> &ThrottleError {
        match self {
            ThrottleError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimit
    }

    pub fn is_backend(&self) -> bool {
        self.kind() == ErrorKind::Backend
    }

    /// True when the store or limiter has been closed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.root(), ThrottleError::Unavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

impl From<validator::ValidationErrors> for ThrottleError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field_errors = errors.field_errors();
        let mut fields: Vec<_> = field_errors.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        match fields.first().and_then(|(field, errs)| errs.first().map(|e| (field, e))) {
            Some((field, err)) => {
                let value = err
                    .params
                    .get("value")
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                let message = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("{} must be positive", field));
                ThrottleError::validation(field.to_string(), value, message)
            }
            None => ThrottleError::Config(errors.to_string()),
        }
    }
}

impl From<envconfig::Error> for ThrottleError {
    fn from(err: envconfig::Error) -> Self {
        ThrottleError::Config(err.to_string())
    }
}
