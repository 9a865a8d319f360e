//! Common error types for Gatehouse components.

use thiserror::Error;

/// Common errors across Gatehouse components
#[derive(Debug, Error)]
pub enum WardenError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable store read/write error
    #[error("Store error: {0}")]
    Store(String),

    /// Ephemeral cache error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Platform gateway call failed (network, permissions, stale chat)
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Challenge generation/verification error
    #[error("Challenge error: {0}")]
    Challenge(String),

    /// Image classifier / OCR service error
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Acting user lacks administrative rights
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A cool-down window is active for the user
    #[error("Rate limited: retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Correlation token is malformed or references nothing
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) => 500,
            Self::Store(_) => 503,
            Self::Cache(_) => 503,
            Self::Gateway(_) => 502,
            Self::Challenge(_) => 500,
            Self::Classifier(_) => 502,
            Self::Unauthorized(_) => 403,
            Self::RateLimited { .. } => 429,
            Self::InvalidToken(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if the failure is transient and the surrounding state
    /// transition should proceed rather than abort.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Cache(_) | Self::Gateway(_) | Self::Classifier(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_denial() {
        let err = WardenError::Unauthorized("not an admin".into());
        assert_eq!(err.status_code(), 403);
        assert!(!err.is_transient());
    }

    #[test]
    fn gateway_failures_are_transient() {
        assert!(WardenError::Gateway("timed out".into()).is_transient());
        assert!(!WardenError::Store("disk full".into()).is_transient());
    }
}
