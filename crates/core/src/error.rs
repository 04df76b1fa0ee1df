use thiserror::Error;

/// Which advisory cap was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Accounts,
    Messages,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Accounts => "Account limit reached",
            LimitKind::Messages => "Message limit reached",
        }
    }
}

/// Error hierarchy for the gateway.
///
/// Callers match on the variant to pick a recovery strategy: `Transient` is
/// retry-eligible with backoff, `Fatal` is terminal for the session or
/// message, everything else maps to an HTTP status at the API edge.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{} (current: {current}, limit: {limit})", kind.as_str())]
    LimitExceeded {
        kind: LimitKind,
        current: i64,
        limit: i64,
    },

    #[error("session {0} is not connected")]
    NotConnected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GatewayError::Validation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        GatewayError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        GatewayError::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_error_display_carries_counts() {
        let err = GatewayError::LimitExceeded {
            kind: LimitKind::Accounts,
            current: 1,
            limit: 1,
        };
        assert_eq!(err.to_string(), "Account limit reached (current: 1, limit: 1)");
    }
}
