//! Error types for Upline
//!
//! One error enum for the whole service. Handlers turn it into a JSON body
//! with `status_code()` and the stable `code()` string.

use hyper::StatusCode;

/// Main error type for Upline operations
#[derive(Debug, thiserror::Error)]
pub enum UplineError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A guarded write found the document in an unexpected state
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Locked income requires {required} active direct referrals (have {current})")]
    ClaimLocked { required: u32, current: u32 },

    #[error("No locked income to claim")]
    NothingToClaim,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Payout error: {0}")]
    Payout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),
}

impl UplineError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientFunds(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ClaimLocked { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NothingToClaim => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Payout(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Machine-readable error code for JSON responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InsufficientFunds(_) => "INSUFFICIENT_FUNDS",
            Self::ClaimLocked { .. } => "CLAIM_LOCKED",
            Self::NothingToClaim => "NOTHING_TO_CLAIM",
            Self::Database(_) => "DB_ERROR",
            Self::Payout(_) => "PAYOUT_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
        }
    }

    /// Whether the operation may succeed if re-read and retried
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

impl From<std::io::Error> for UplineError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for UplineError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for UplineError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for UplineError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for UplineError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON serialization failed: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for UplineError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for Upline operations
pub type Result<T> = std::result::Result<T, UplineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            UplineError::InsufficientFunds("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            UplineError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            UplineError::ClaimLocked { required: 2, current: 0 }.code(),
            "CLAIM_LOCKED"
        );
    }

    #[test]
    fn test_claim_locked_message() {
        let err = UplineError::ClaimLocked { required: 3, current: 1 };
        assert_eq!(
            err.to_string(),
            "Locked income requires 3 active direct referrals (have 1)"
        );
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(UplineError::Conflict("stale".into()).is_conflict());
        assert!(!UplineError::InsufficientFunds("low".into()).is_conflict());
        assert!(!UplineError::Database("down".into()).is_conflict());
    }
}
