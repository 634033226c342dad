//! MPC computation cluster contract
//!
//! The orchestration layer never performs threshold cryptography itself; it
//! drives an external computation cluster through this trait. The contract
//! the implementation must honor:
//!
//! - no message ever carries a participant's full private share to any other
//!   participant or to the orchestrator;
//! - the orchestrator sees only public commitments and the aggregated public
//!   key;
//! - an aborted key-generation run surfaces an error and never persists
//!   partial key material.

mod memory;

pub use memory::MemoryCluster;

use crate::types::{KeyType, NodeId};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Input to a distributed key-generation run
#[derive(Debug, Clone)]
pub struct KeygenSpec {
    /// Wallet identifier the key material will belong to
    pub wallet_id: String,
    pub key_type: KeyType,
    /// Minimum signers `t`
    pub threshold: u16,
    /// Ordered participant set; its length is `n`
    pub participant_node_ids: Vec<NodeId>,
}

/// Result of a successful key-generation run
#[derive(Debug, Clone)]
pub struct KeygenOutcome {
    /// Aggregated public key. Compressed SEC1 for ECDSA, 32-byte ed25519
    /// point for EdDSA, 32-byte x-only point for Taproot.
    pub public_key: Vec<u8>,
}

/// One participant's contribution toward a combined signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    /// Contributing participant
    pub node_id: NodeId,
    /// Opaque share payload (hex); only the cluster can interpret it
    pub payload: String,
}

/// Input to share combination
#[derive(Debug, Clone)]
pub struct CombineRequest {
    pub wallet_id: String,
    pub key_type: KeyType,
    /// Wallet's aggregated public key, used to verify the result
    pub public_key: Vec<u8>,
    /// Message the signature must cover
    pub message: Vec<u8>,
    /// Minimum share count
    pub threshold: u16,
    pub shares: Vec<SignatureShare>,
}

/// A combined threshold signature
#[derive(Debug, Clone)]
pub struct CombinedSignature {
    /// Signature bytes (hex)
    pub signature: String,
}

/// Driver interface for the external MPC computation cluster
#[async_trait]
pub trait MpcCluster: Send + Sync {
    /// Run distributed key generation across the participant set.
    ///
    /// Any participant failure, timeout, or share-verification mismatch
    /// aborts the whole run; partial key material from an aborted run is
    /// never retained.
    async fn run_keygen(&self, spec: &KeygenSpec) -> Result<KeygenOutcome>;

    /// Ask one participant to produce its signature share over `message`
    async fn produce_share(
        &self,
        wallet_id: &str,
        node_id: &str,
        message: &[u8],
    ) -> Result<SignatureShare>;

    /// Combine collected shares into a final signature.
    ///
    /// Fails with `VerificationFailed` when any share does not verify
    /// against the wallet's public key.
    async fn combine_shares(&self, request: &CombineRequest) -> Result<CombinedSignature>;
}
