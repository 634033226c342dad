//! Error types for key protection

use thiserror::Error;

/// Result type alias for key-protection operations
pub type Result<T> = std::result::Result<T, HsmError>;

/// Errors from key-protection providers.
///
/// Connectivity and availability failures (`ProviderUnavailable`) are kept
/// apart from cryptographic failures: callers retry provider selection on
/// the former and treat data as invalid on the latter. A signature that
/// does not verify is `Ok(false)` from `verify`, never an error.
#[derive(Debug, Error)]
pub enum HsmError {
    /// Operation called outside the `Active` state
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Backend unreachable: cluster down, permission denied, library or
    /// device missing
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// A cryptographic operation failed (bad ciphertext, wrong key)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid or incomplete provider configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The secure element reports physical tampering
    #[error("Tamper detected: {0}")]
    TamperDetected(String),

    /// A hardware-backed provider was required but is not available
    #[error("Hardware protection required: {0}")]
    HardwareRequired(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HsmError {
    /// Whether retrying provider selection may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, HsmError::ProviderUnavailable(_))
    }
}

impl From<serde_json::Error> for HsmError {
    fn from(err: serde_json::Error) -> Self {
        HsmError::Serialization(err.to_string())
    }
}
