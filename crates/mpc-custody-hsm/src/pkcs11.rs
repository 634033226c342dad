//! PKCS#11 transport seam
//!
//! The network HSM cluster and the embedded secure element both speak
//! PKCS#11 through a vendor library. [`Pkcs11Module`] abstracts that
//! transport so provider logic (cluster verification, tamper checks, state
//! machine) is testable without the vendor library or a device; the
//! in-process [`SoftTokenModule`] scripts every failure mode.

use crate::provider::KeyPairHandle;
use crate::{HsmError, Result};
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

type HmacSha256 = Hmac<Sha256>;

/// Session-level operations against a PKCS#11 token
#[async_trait]
pub trait Pkcs11Module: Send + Sync {
    /// Number of slots with a token present
    async fn slot_count(&self) -> Result<u32>;

    /// Open a read-write session on `slot` and log in with `pin`
    async fn open_session(&self, slot: u32, pin: &str) -> Result<()>;

    /// Log out and close the session. Safe to call without a session.
    async fn close_session(&self) -> Result<()>;

    /// AES-GCM style encrypt with the token key under `key_label`;
    /// the nonce is carried inside the returned blob
    async fn encrypt(&self, key_label: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of [`Pkcs11Module::encrypt`]
    async fn decrypt(&self, key_label: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Sign with the token's private key under `key_label`
    async fn sign(&self, key_label: &str, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify against the token's public key; mismatch is `Ok(false)`
    async fn verify(&self, key_label: &str, data: &[u8], signature: &[u8]) -> Result<bool>;

    /// Generate a key pair on the token, labeled `<label>-pub`/`<label>-priv`
    async fn generate_key_pair(&self, key_label: &str) -> Result<KeyPairHandle>;
}

const NONCE_LEN: usize = 12;

/// In-process token for tests and local development.
///
/// Keys are derived per label, sessions are tracked, and the fault toggles
/// reproduce the transport failures a real module can hit.
pub struct SoftTokenModule {
    keys: DashMap<String, [u8; 32]>,
    slots: AtomicU32,
    session_open: AtomicBool,
    fail_open: AtomicBool,
    fail_ops: AtomicBool,
}

impl SoftTokenModule {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            slots: AtomicU32::new(1),
            session_open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_ops: AtomicBool::new(false),
        }
    }

    /// Simulate an empty or unreachable token
    pub fn set_slots(&self, slots: u32) {
        self.slots.store(slots, Ordering::SeqCst);
    }

    /// Make session opening fail
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make cryptographic operations fail
    pub fn set_fail_ops(&self, fail: bool) {
        self.fail_ops.store(fail, Ordering::SeqCst);
    }

    pub fn session_is_open(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }

    fn key_for(&self, label: &str) -> [u8; 32] {
        *self.keys.entry(label.to_string()).or_insert_with(|| {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            key
        })
    }

    fn guard(&self) -> Result<()> {
        if !self.session_open.load(Ordering::SeqCst) {
            return Err(HsmError::ProviderUnavailable("no open session".into()));
        }
        if self.fail_ops.load(Ordering::SeqCst) {
            return Err(HsmError::ProviderUnavailable("token not responding".into()));
        }
        Ok(())
    }
}

impl Default for SoftTokenModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pkcs11Module for SoftTokenModule {
    async fn slot_count(&self) -> Result<u32> {
        Ok(self.slots.load(Ordering::SeqCst))
    }

    async fn open_session(&self, slot: u32, _pin: &str) -> Result<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(HsmError::ProviderUnavailable(
                "could not open session: token unreachable".into(),
            ));
        }
        let slots = self.slots.load(Ordering::SeqCst);
        if slots == 0 {
            return Err(HsmError::ProviderUnavailable("no slots found".into()));
        }
        if slot >= slots {
            return Err(HsmError::Config(format!(
                "invalid slot {slot}, available slots: 0-{}",
                slots - 1
            )));
        }
        self.session_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_session(&self) -> Result<()> {
        self.session_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn encrypt(&self, key_label: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.guard()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key_for(key_label)));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| HsmError::Crypto("encryption failed".into()))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    async fn decrypt(&self, key_label: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.guard()?;
        if ciphertext.len() < NONCE_LEN {
            return Err(HsmError::Crypto("ciphertext too short".into()));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key_for(key_label)));
        let (nonce_bytes, payload) = ciphertext.split_at(NONCE_LEN);

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| HsmError::Crypto("decryption failed: bad tag".into()))
    }

    async fn sign(&self, key_label: &str, data: &[u8]) -> Result<Vec<u8>> {
        self.guard()?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key_for(key_label))
            .map_err(|e| HsmError::Crypto(format!("mac key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    async fn verify(&self, key_label: &str, data: &[u8], signature: &[u8]) -> Result<bool> {
        let expected = self.sign(key_label, data).await?;
        Ok(expected == signature)
    }

    async fn generate_key_pair(&self, key_label: &str) -> Result<KeyPairHandle> {
        self.guard()?;
        self.key_for(&format!("{key_label}-priv"));
        Ok(KeyPairHandle {
            public_handle: format!("{key_label}-pub"),
            private_handle: format!("{key_label}-priv"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_per_label() {
        let token = SoftTokenModule::new();
        token.open_session(0, "1234").await.unwrap();

        let blob = token.encrypt("root", b"secret").await.unwrap();
        assert_eq!(token.decrypt("root", &blob).await.unwrap(), b"secret");

        // A different label uses a different key
        assert!(token.decrypt("other", &blob).await.is_err());
    }

    #[tokio::test]
    async fn test_operations_require_session() {
        let token = SoftTokenModule::new();
        let err = token.encrypt("root", b"x").await.unwrap_err();
        assert!(matches!(err, HsmError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_slot() {
        let token = SoftTokenModule::new();
        assert!(matches!(
            token.open_session(3, "1234").await.unwrap_err(),
            HsmError::Config(_)
        ));
        token.set_slots(0);
        assert!(matches!(
            token.open_session(0, "1234").await.unwrap_err(),
            HsmError::ProviderUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_sign_verify_mismatch_is_false() {
        let token = SoftTokenModule::new();
        token.open_session(0, "1234").await.unwrap();

        let signature = token.sign("root", b"data").await.unwrap();
        assert!(token.verify("root", b"data", &signature).await.unwrap());
        assert!(!token.verify("root", b"other", &signature).await.unwrap());
    }
}
