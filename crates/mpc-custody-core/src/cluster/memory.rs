//! In-process MPC cluster for tests and local development
//!
//! Simulates the external computation cluster: key generation produces a
//! real keypair per key type, shares are MAC tags a tampered payload cannot
//! forge, and combination signs with the held key. Not a threshold scheme;
//! the state machines driving it cannot tell the difference, which is the
//! point.

use super::{CombineRequest, CombinedSignature, KeygenOutcome, KeygenSpec, MpcCluster, SignatureShare};
use crate::types::KeyType;
use crate::{CustodyError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

enum HeldKey {
    Ecdsa(k256::ecdsa::SigningKey),
    Eddsa(ed25519_dalek::SigningKey),
    Taproot(k256::schnorr::SigningKey),
}

impl HeldKey {
    fn secret_bytes(&self) -> Vec<u8> {
        match self {
            HeldKey::Ecdsa(key) => key.to_bytes().to_vec(),
            HeldKey::Eddsa(key) => key.to_bytes().to_vec(),
            HeldKey::Taproot(key) => key.to_bytes().to_vec(),
        }
    }

    fn public_bytes(&self) -> Vec<u8> {
        match self {
            HeldKey::Ecdsa(key) => key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes()
                .to_vec(),
            HeldKey::Eddsa(key) => key.verifying_key().to_bytes().to_vec(),
            HeldKey::Taproot(key) => key.verifying_key().to_bytes().to_vec(),
        }
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            HeldKey::Ecdsa(key) => {
                use k256::ecdsa::signature::Signer;
                let signature: k256::ecdsa::Signature = key.sign(message);
                signature.to_bytes().to_vec()
            }
            HeldKey::Eddsa(key) => {
                use ed25519_dalek::Signer;
                key.sign(message).to_bytes().to_vec()
            }
            HeldKey::Taproot(key) => {
                use k256::schnorr::signature::Signer;
                let signature: k256::schnorr::Signature = key.sign(message);
                signature.to_bytes().to_vec()
            }
        }
    }
}

/// In-memory cluster implementation
#[derive(Default)]
pub struct MemoryCluster {
    keys: DashMap<String, HeldKey>,
    combine_attempts: AtomicU64,
    fail_keygen: AtomicBool,
    fail_combine: AtomicBool,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `combine_shares` has run. Tests use this to assert
    /// the single-combination property.
    pub fn combine_attempts(&self) -> u64 {
        self.combine_attempts.load(Ordering::SeqCst)
    }

    /// Make the next key-generation runs abort
    pub fn set_fail_keygen(&self, fail: bool) {
        self.fail_keygen.store(fail, Ordering::SeqCst);
    }

    /// Make the next combination runs abort
    pub fn set_fail_combine(&self, fail: bool) {
        self.fail_combine.store(fail, Ordering::SeqCst);
    }

    fn share_tag(&self, secret: &[u8], node_id: &str, message: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| CustodyError::Internal(format!("mac key: {e}")))?;
        mac.update(node_id.as_bytes());
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[async_trait]
impl MpcCluster for MemoryCluster {
    #[instrument(skip(self, spec), fields(wallet_id = %spec.wallet_id, key_type = %spec.key_type))]
    async fn run_keygen(&self, spec: &KeygenSpec) -> Result<KeygenOutcome> {
        if self.fail_keygen.load(Ordering::SeqCst) {
            // Nothing is stored on the abort path
            warn!("key generation aborted");
            return Err(CustodyError::Internal(
                "key generation aborted: participant failure".into(),
            ));
        }
        if spec.participant_node_ids.len() < spec.threshold as usize {
            return Err(CustodyError::Invalid(format!(
                "participant set smaller than threshold {}",
                spec.threshold
            )));
        }

        let key = match spec.key_type {
            KeyType::Ecdsa => HeldKey::Ecdsa(k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng)),
            KeyType::Eddsa => {
                HeldKey::Eddsa(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
            }
            KeyType::Taproot => {
                HeldKey::Taproot(k256::schnorr::SigningKey::random(&mut rand::rngs::OsRng))
            }
        };
        let public_key = key.public_bytes();

        self.keys.insert(spec.wallet_id.clone(), key);
        debug!(parties = spec.participant_node_ids.len(), "key generation complete");
        Ok(KeygenOutcome { public_key })
    }

    async fn produce_share(
        &self,
        wallet_id: &str,
        node_id: &str,
        message: &[u8],
    ) -> Result<SignatureShare> {
        let key = self
            .keys
            .get(wallet_id)
            .ok_or_else(|| CustodyError::NotFound(format!("no key material for {wallet_id}")))?;

        let tag = self.share_tag(&key.secret_bytes(), node_id, message)?;
        Ok(SignatureShare {
            node_id: node_id.to_string(),
            payload: hex::encode(tag),
        })
    }

    #[instrument(skip(self, request), fields(wallet_id = %request.wallet_id))]
    async fn combine_shares(&self, request: &CombineRequest) -> Result<CombinedSignature> {
        self.combine_attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail_combine.load(Ordering::SeqCst) {
            return Err(CustodyError::Internal("combination aborted".into()));
        }

        if request.shares.len() < request.threshold as usize {
            return Err(CustodyError::PreconditionFailed(format!(
                "{} shares provided, {} required",
                request.shares.len(),
                request.threshold
            )));
        }

        let key = self.keys.get(&request.wallet_id).ok_or_else(|| {
            CustodyError::NotFound(format!("no key material for {}", request.wallet_id))
        })?;
        if key.public_bytes() != request.public_key {
            return Err(CustodyError::VerificationFailed(
                "public key does not match held key material".into(),
            ));
        }

        let secret = key.secret_bytes();
        for share in &request.shares {
            let expected = self.share_tag(&secret, &share.node_id, &request.message)?;
            let provided = hex::decode(&share.payload)?;
            if provided != expected {
                return Err(CustodyError::VerificationFailed(format!(
                    "share from {} failed verification",
                    share.node_id
                )));
            }
        }

        let signature = key.sign(&request.message);
        debug!(shares = request.shares.len(), "shares combined");
        Ok(CombinedSignature {
            signature: hex::encode(signature),
        })
    }
}
