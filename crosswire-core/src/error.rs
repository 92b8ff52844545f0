// ABOUTME: Typed error kinds for registry and scheduler operations
// ABOUTME: Callers match on ErrorKind; messages keep the caller-matchable substrings

use std::fmt;

/// Typed failure categories for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Per-key pending request cap exceeded
    Capacity,
    /// Sliding-window rate limit exceeded
    RateLimit,
    /// No record with the given ID
    NotFound,
    /// Record already reached a terminal state, or the job is mid-run
    Conflict,
    /// Caller's cancellation signal fired while waiting
    Aborted,
    /// Caller's own wait deadline elapsed before the record went terminal
    WaitTimeout,
    /// Malformed input (empty session key, zero interval, bad cron expression)
    InvalidInput,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Capacity => "capacity",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Aborted => "aborted",
            ErrorKind::WaitTimeout => "wait_timeout",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RegistryError {
    kind: ErrorKind,
    message: String,
}

impl RegistryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RegistryError {}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_is_matchable() {
        let err = RegistryError::new(ErrorKind::RateLimit, "rate limit exceeded for child 'x'");
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert!(err.to_string().contains("rate limit"));
    }

    #[test]
    fn test_error_kind_as_str() {
        assert_eq!(ErrorKind::Capacity.as_str(), "capacity");
        assert_eq!(ErrorKind::Aborted.as_str(), "aborted");
        assert_eq!(ErrorKind::WaitTimeout.as_str(), "wait_timeout");
    }
}
