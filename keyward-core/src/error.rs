//! Top-level error types for Keyward.

use thiserror::Error;

use crate::http::{HttpError, RequestError};
use crate::model::ParseError;
use crate::store::StoreError;
use crate::token::TokenError;

/// Top-level error type encompassing all Keyward errors.
#[derive(Debug, Error)]
pub enum KeywardError {
    /// A correlation nonce was missing, forged or stale.
    #[error("invalid nonce for {action}")]
    InvalidNonce { action: String },

    /// A token-requiring call was attempted with no token bound.
    #[error("{service} requires a token but none is bound")]
    MissingToken { service: String },

    /// The provider rejected a handshake step, or the callback was incomplete.
    #[error("authorization failed for {service}: {message}")]
    AuthorizationFailed { service: String, message: String },

    /// A resource call failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The token store could not complete an operation.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// Error from token operations.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// No service with this name is registered.
    #[error("unknown service: {service}")]
    UnknownService { service: String },

    /// The action is not one the orchestrator dispatches.
    #[error("unsupported action: {action}")]
    UnsupportedAction { action: String },

    /// The service lacks the application credentials it needs.
    #[error("{service} is not configured")]
    NotConfigured { service: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl KeywardError {
    pub(crate) fn authorization(service: impl std::fmt::Display, message: impl Into<String>) -> Self {
        Self::AuthorizationFailed {
            service: service.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidNonce { .. } => "invalid_nonce",
            Self::MissingToken { .. } => "missing_token",
            Self::AuthorizationFailed { .. } => "authorization_failed",
            Self::Request(_) => "request_error",
            Self::Storage(_) => "storage_failure",
            Self::Token(_) => "token_error",
            Self::UnknownService { .. } => "unknown_service",
            Self::UnsupportedAction { .. } => "unsupported_action",
            Self::NotConfigured { .. } => "not_configured",
            Self::Config { .. } => "config_error",
        }
    }
}

impl From<HttpError> for KeywardError {
    fn from(error: HttpError) -> Self {
        Self::Request(error.into())
    }
}

impl From<ParseError> for KeywardError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::UnknownAction { action } => Self::UnsupportedAction { action },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_becomes_request_error() {
        let error = KeywardError::from(HttpError::Timeout);
        match error {
            KeywardError::Request(request) => assert_eq!(request.status, None),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_action_is_unsupported() {
        let error = KeywardError::from("explode".parse::<crate::model::Action>().unwrap_err());
        assert_eq!(error.kind(), "unsupported_action");
        assert_eq!(error.to_string(), "unsupported action: explode");
    }

    #[test]
    fn test_storage_error_kind() {
        let error = KeywardError::from(StoreError::UnscopedDelete);
        assert_eq!(error.kind(), "storage_failure");
    }
}
