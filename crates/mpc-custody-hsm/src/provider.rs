//! Key-protection provider contract
//!
//! Every backend implements the same capability set behind [`KeyProtector`]
//! so the root key service can treat a no-op software provider, a network
//! HSM cluster, a cloud KMS, and an embedded secure element uniformly.
//! Initialization is an explicit state machine; every cryptographic
//! operation fails fast with `NotInitialized` outside `Active`.

use crate::{HsmError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Provider backend kinds, a closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// No-op software fallback, no real protection
    Software,
    /// Network HSM cluster (PKCS#11 over a managed fleet)
    CloudHsm,
    /// Cloud key-management service (REST)
    CloudKms,
    /// Embedded secure element (PKCS#11 against a local device)
    SecureElement,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Software => "software",
            ProviderKind::CloudHsm => "cloud_hsm",
            ProviderKind::CloudKms => "cloud_kms",
            ProviderKind::SecureElement => "secure_element",
        };
        f.write_str(name)
    }
}

/// Provider lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitState {
    Uninitialized,
    Initializing,
    Active,
    /// `initialize()` failed; the provider stays unusable until replaced
    Failed,
}

/// Structured health status, cached with a TTL so tight polling loops do
/// not overload the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Backend reachable
    pub reachable: bool,
    /// Whether key material is protected by hardware. Callers requiring
    /// hardware assurance must check this and refuse the software no-op.
    pub hardware_backed: bool,
    /// Active HSM count for clustered backends
    pub hsm_count: Option<u32>,
    /// Tamper flag for secure elements
    pub tamper_detected: Option<bool>,
    /// When this status was observed
    pub checked_at: DateTime<Utc>,
}

/// Handles to a generated key pair. The private handle is a backend
/// reference (label, resource name), never raw key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairHandle {
    pub public_handle: String,
    pub private_handle: String,
}

/// Uniform capability set every key-protection backend implements
#[async_trait]
pub trait KeyProtector: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> ProviderKind;

    /// Whether operations run inside hardware
    fn is_hardware_backed(&self) -> bool;

    /// Current lifecycle state
    fn state(&self) -> InitState;

    /// Bring the provider to `Active`. Fails into `Failed`; a provider in
    /// `Failed` is never silently retried.
    async fn initialize(&self) -> Result<()>;

    /// Release backend resources. Must be idempotent-safe: finalizing a
    /// never-initialized provider is a no-op, not an error.
    async fn finalize(&self) -> Result<()>;

    /// Encrypt under the protected key
    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt under the protected key
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Sign with the protected key
    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature. A mismatch is `Ok(false)`, never an error.
    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool>;

    /// Generate a key pair inside the backend
    async fn generate_key_pair(&self) -> Result<KeyPairHandle>;

    /// Structured health status; implementations serve cached results
    /// within their TTL
    async fn health_check(&self) -> Result<HealthStatus>;

    /// Whether cryptographic operations are currently allowed
    fn is_active(&self) -> bool {
        self.state() == InitState::Active
    }
}

/// TTL cache for health statuses, shared by the provider implementations
pub(crate) struct HealthCache {
    ttl: Duration,
    last: Mutex<Option<HealthStatus>>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last: Mutex::new(None),
        }
    }

    /// Cached status if it is still fresh
    pub fn fresh(&self) -> Option<HealthStatus> {
        let last = self.last.lock();
        last.as_ref()
            .filter(|status| {
                let age = Utc::now() - status.checked_at;
                age.to_std().map(|age| age < self.ttl).unwrap_or(false)
            })
            .cloned()
    }

    pub fn store(&self, status: HealthStatus) {
        *self.last.lock() = Some(status);
    }
}

/// Guard helper shared by providers: error unless `Active`
pub(crate) fn ensure_active(state: InitState, kind: ProviderKind) -> Result<()> {
    if state != InitState::Active {
        return Err(HsmError::NotInitialized(format!(
            "{kind} provider is {state:?}, call initialize() first"
        )));
    }
    Ok(())
}
