//! Error types for custody orchestration

use thiserror::Error;

/// Result type alias for custody operations
pub type Result<T> = std::result::Result<T, CustodyError>;

/// Errors that can occur during custody orchestration
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Entity absent or not visible to the calling organization
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness or state-precondition violation (duplicate approval,
    /// node still referenced by a wallet, duplicate node identifier)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not valid in the entity's current state
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Malformed input (bad threshold, unknown chain, undecodable payload)
    #[error("Invalid: {0}")]
    Invalid(String),

    /// A dependent subsystem has not been initialized
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// A hardware or cloud backend could not be reached. Distinct from
    /// cryptographic failure: callers may retry provider selection.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A cryptographic check did not hold (share mismatch, bad commitment)
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Storage-layer failure. All DAL errors are wrapped into this variant
    /// before crossing into orchestration logic; the cause is preserved in
    /// the message for logging.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Broadcast collaborator failure
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    /// Get the HTTP status code an administrative surface should map this to
    pub fn status_code(&self) -> u16 {
        match self {
            CustodyError::NotFound(_) => 404,
            CustodyError::Conflict(_) => 409,
            CustodyError::PreconditionFailed(_) => 412,
            CustodyError::Invalid(_) => 400,
            CustodyError::NotInitialized(_) => 503,
            CustodyError::ProviderUnavailable(_) => 503,
            CustodyError::VerificationFailed(_) => 422,
            CustodyError::Database(_) => 500,
            CustodyError::Serialization(_) => 400,
            CustodyError::Broadcast(_) => 502,
            CustodyError::Internal(_) => 500,
        }
    }

    /// Check if this error is retryable without changing the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CustodyError::ProviderUnavailable(_)
                | CustodyError::Database(_)
                | CustodyError::Broadcast(_)
        )
    }
}

impl From<serde_json::Error> for CustodyError {
    fn from(err: serde_json::Error) -> Self {
        CustodyError::Serialization(err.to_string())
    }
}

impl From<hex::FromHexError> for CustodyError {
    fn from(err: hex::FromHexError) -> Self {
        CustodyError::Invalid(format!("bad hex payload: {err}"))
    }
}
