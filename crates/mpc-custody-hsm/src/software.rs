//! Software no-op provider
//!
//! The fallback when no hardware signal is present. Encryption still
//! round-trips (ChaCha20-Poly1305 under a process-local key) so the data
//! path works in development, but the key never leaves process memory and
//! `hardware_backed` is false so callers that require hardware assurance
//! can detect and refuse it.

use crate::provider::{
    ensure_active, HealthCache, HealthStatus, InitState, KeyPairHandle, KeyProtector, ProviderKind,
};
use crate::{HsmError, Result};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

/// No-op software provider
pub struct SoftwareProtector {
    key: Zeroizing<[u8; 32]>,
    state: RwLock<InitState>,
    health: HealthCache,
}

impl SoftwareProtector {
    /// Create with a fresh process-local key
    pub fn new() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(key.as_mut());
        Self {
            key,
            state: RwLock::new(InitState::Uninitialized),
            health: HealthCache::new(Duration::from_secs(30)),
        }
    }
}

impl Default for SoftwareProtector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyProtector for SoftwareProtector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Software
    }

    fn is_hardware_backed(&self) -> bool {
        false
    }

    fn state(&self) -> InitState {
        *self.state.read()
    }

    async fn initialize(&self) -> Result<()> {
        *self.state.write() = InitState::Initializing;
        warn!("software key protection active: root key is not hardware-backed");
        *self.state.write() = InitState::Active;
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        *self.state.write() = InitState::Uninitialized;
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_ref()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| HsmError::Crypto("encryption failed".into()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        if ciphertext.len() < NONCE_LEN {
            return Err(HsmError::Crypto("ciphertext too short".into()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_ref()));
        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| HsmError::Crypto("decryption failed: bad tag".into()))
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.as_ref())
            .map_err(|e| HsmError::Crypto(format!("mac key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        let expected = self.sign(data).await?;
        Ok(expected == signature)
    }

    async fn generate_key_pair(&self) -> Result<KeyPairHandle> {
        ensure_active(self.state(), self.kind())?;
        let mut id = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut id);
        let label = format!("software-{}", hex::encode(id));
        Ok(KeyPairHandle {
            public_handle: format!("{label}-pub"),
            private_handle: format!("{label}-priv"),
        })
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if let Some(cached) = self.health.fresh() {
            return Ok(cached);
        }
        let status = HealthStatus {
            reachable: true,
            hardware_backed: false,
            hsm_count: None,
            tamper_detected: None,
            checked_at: Utc::now(),
        };
        self.health.store(status.clone());
        Ok(status)
    }
}
