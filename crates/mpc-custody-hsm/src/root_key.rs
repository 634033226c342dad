//! Root key service
//!
//! Owns a single 32-byte root key that envelope-encrypts everything else
//! the custody system persists. The root key exists in plaintext only in
//! process memory; at rest it is wrapped by the configured
//! [`KeyProtector`]. Startup never downgrades silently: if the backend
//! fails to initialize, or hardware assurance is required and the backend
//! cannot provide it, startup fails and no key material is produced.

use crate::provider::{InitState, KeyProtector};
use crate::{HsmError, Result};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

const ROOT_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Envelope encryption under a provider-wrapped root key
pub struct RootKeyService {
    provider: Arc<dyn KeyProtector>,
    /// Refuse to start on a backend without hardware assurance
    require_hardware: bool,
    root: RwLock<Option<Zeroizing<[u8; ROOT_KEY_LEN]>>>,
    /// Root key as wrapped by the provider, safe to persist
    wrapped: RwLock<Option<Vec<u8>>>,
}

impl RootKeyService {
    pub fn new(provider: Arc<dyn KeyProtector>, require_hardware: bool) -> Self {
        Self {
            provider,
            require_hardware,
            root: RwLock::new(None),
            wrapped: RwLock::new(None),
        }
    }

    /// Initialize the backend and establish the root key.
    ///
    /// Pass the previously persisted wrapped root key to unwrap it, or
    /// `None` to generate a fresh one. Provider failure propagates;
    /// there is no fallback to a weaker backend here.
    #[instrument(skip_all, fields(provider = %self.provider.kind()))]
    pub async fn start(&self, wrapped_root: Option<&[u8]>) -> Result<()> {
        if self.require_hardware && !self.provider.is_hardware_backed() {
            return Err(HsmError::HardwareRequired(format!(
                "{} provider is not hardware-backed",
                self.provider.kind()
            )));
        }

        self.provider.initialize().await?;

        if !self.provider.is_hardware_backed() {
            warn!("root key protection is software-only");
        }

        let root = match wrapped_root {
            Some(wrapped) => {
                let plain = self.provider.decrypt(wrapped).await?;
                if plain.len() != ROOT_KEY_LEN {
                    return Err(HsmError::Crypto(format!(
                        "unwrapped root key has {} bytes, expected {ROOT_KEY_LEN}",
                        plain.len()
                    )));
                }
                let mut key = Zeroizing::new([0u8; ROOT_KEY_LEN]);
                key.copy_from_slice(&plain);
                *self.wrapped.write() = Some(wrapped.to_vec());
                key
            }
            None => {
                let mut key = Zeroizing::new([0u8; ROOT_KEY_LEN]);
                rand::rngs::OsRng.fill_bytes(key.as_mut());
                let wrapped = self.provider.encrypt(key.as_ref()).await?;
                *self.wrapped.write() = Some(wrapped);
                key
            }
        };

        *self.root.write() = Some(root);
        info!("root key service started");
        Ok(())
    }

    /// Whether the service holds an unwrapped root key
    pub fn is_started(&self) -> bool {
        self.root.read().is_some()
    }

    /// The provider-wrapped root key, for persistence
    pub fn wrapped_root(&self) -> Option<Vec<u8>> {
        self.wrapped.read().clone()
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        let root = self.root.read();
        let key = root
            .as_ref()
            .ok_or_else(|| HsmError::NotInitialized("root key service not started".into()))?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_ref())))
    }

    /// Envelope-encrypt under the root key; the nonce is carried in the
    /// returned blob
    pub fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| HsmError::Crypto("envelope encryption failed".into()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Inverse of [`RootKeyService::protect`]
    pub fn unprotect(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        if ciphertext.len() < NONCE_LEN {
            return Err(HsmError::Crypto("ciphertext too short".into()));
        }
        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| HsmError::Crypto("envelope decryption failed: bad tag".into()))
    }

    /// Drop the in-memory root key and release the backend. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        *self.root.write() = None;
        if self.provider.state() != InitState::Uninitialized {
            self.provider.finalize().await?;
        }
        info!("root key service shut down");
        Ok(())
    }
}

/// Convenience trait object constructor used by binaries
#[async_trait]
pub trait RootKeyStore: Send + Sync {
    /// Load the persisted wrapped root key, if any
    async fn load_wrapped(&self) -> Result<Option<Vec<u8>>>;
    /// Persist the wrapped root key
    async fn save_wrapped(&self, wrapped: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HealthStatus, KeyPairHandle, ProviderKind};
    use crate::software::SoftwareProtector;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Hardware-claiming provider whose initialization can be scripted to
    /// fail, for downgrade-refusal coverage
    struct FlakyHardwareProvider {
        inner: SoftwareProtector,
        fail_init: AtomicBool,
    }

    impl FlakyHardwareProvider {
        fn new(fail_init: bool) -> Self {
            Self {
                inner: SoftwareProtector::new(),
                fail_init: AtomicBool::new(fail_init),
            }
        }
    }

    #[async_trait]
    impl KeyProtector for FlakyHardwareProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::CloudHsm
        }
        fn is_hardware_backed(&self) -> bool {
            true
        }
        fn state(&self) -> InitState {
            self.inner.state()
        }
        async fn initialize(&self) -> Result<()> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(HsmError::ProviderUnavailable("cluster unreachable".into()));
            }
            self.inner.initialize().await
        }
        async fn finalize(&self) -> Result<()> {
            self.inner.finalize().await
        }
        async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
            self.inner.encrypt(plaintext).await
        }
        async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
            self.inner.decrypt(ciphertext).await
        }
        async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
            self.inner.sign(data).await
        }
        async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
            self.inner.verify(data, signature).await
        }
        async fn generate_key_pair(&self) -> Result<KeyPairHandle> {
            self.inner.generate_key_pair().await
        }
        async fn health_check(&self) -> Result<HealthStatus> {
            Ok(HealthStatus {
                reachable: true,
                hardware_backed: true,
                hsm_count: Some(1),
                tamper_detected: None,
                checked_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_protect_round_trip() {
        let service = RootKeyService::new(Arc::new(SoftwareProtector::new()), false);
        service.start(None).await.unwrap();

        for input in [vec![], vec![0x42], vec![7u8; 2 * 1024 * 1024]] {
            let blob = service.protect(&input).unwrap();
            assert_eq!(service.unprotect(&blob).unwrap(), input);
        }
    }

    #[tokio::test]
    async fn test_wrapped_root_restores_same_key() {
        let provider = Arc::new(SoftwareProtector::new());
        let service = RootKeyService::new(provider.clone(), false);
        service.start(None).await.unwrap();

        let wrapped = service.wrapped_root().unwrap();
        let blob = service.protect(b"persisted secret").unwrap();

        // A second service instance on the same provider unwraps the same
        // root key and can read previously protected data
        let restored = RootKeyService::new(provider, false);
        restored.start(Some(&wrapped)).await.unwrap();
        assert_eq!(restored.unprotect(&blob).unwrap(), b"persisted secret");
    }

    #[tokio::test]
    async fn test_hardware_init_failure_blocks_start() {
        let provider = Arc::new(FlakyHardwareProvider::new(true));
        let service = RootKeyService::new(provider, true);

        let err = service.start(None).await.unwrap_err();
        assert!(matches!(err, HsmError::ProviderUnavailable(_)));
        assert!(!service.is_started());
        assert!(service.wrapped_root().is_none());
        assert!(service.protect(b"x").is_err());
    }

    #[tokio::test]
    async fn test_require_hardware_refuses_software_provider() {
        let service = RootKeyService::new(Arc::new(SoftwareProtector::new()), true);
        let err = service.start(None).await.unwrap_err();
        assert!(matches!(err, HsmError::HardwareRequired(_)));
        assert!(!service.is_started());
    }

    #[tokio::test]
    async fn test_hardware_provider_accepted_when_required() {
        let provider = Arc::new(FlakyHardwareProvider::new(false));
        let service = RootKeyService::new(provider, true);
        service.start(None).await.unwrap();
        assert!(service.is_started());
    }

    #[tokio::test]
    async fn test_shutdown_drops_key_and_is_idempotent() {
        let service = RootKeyService::new(Arc::new(SoftwareProtector::new()), false);
        service.start(None).await.unwrap();
        assert!(service.is_started());

        service.shutdown().await.unwrap();
        assert!(!service.is_started());
        assert!(matches!(
            service.protect(b"x").unwrap_err(),
            HsmError::NotInitialized(_)
        ));
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_envelope_rejected() {
        let service = RootKeyService::new(Arc::new(SoftwareProtector::new()), false);
        service.start(None).await.unwrap();

        let mut blob = service.protect(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(
            service.unprotect(&blob).unwrap_err(),
            HsmError::Crypto(_)
        ));
    }
}
