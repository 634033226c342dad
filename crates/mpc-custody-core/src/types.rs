//! Core types for the threshold-custody subsystem
//!
//! Defines the persisted entities (nodes, wallets, signing requests and
//! approvals), their closed status enumerations, and the identifiers used
//! to scope every query to an organization.

use crate::chain::Chain;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Organization identifier (owned by an external identity collaborator)
pub type OrgId = String;

/// Project identifier (optional scope inside an organization)
pub type ProjectId = String;

/// Network-visible MPC node identifier, unique per organization
pub type NodeId = String;

/// Generated wallet identifier, unique per organization
pub type WalletId = String;

/// Signing request row identifier
pub type RequestId = String;

/// Signing approval row identifier
pub type ApprovalId = String;

/// User identifier (owned by an external identity collaborator)
pub type UserId = String;

/// Free-form node metadata: an open string-to-scalar map carried at the
/// boundary. Orchestration logic never branches on its contents.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Key types supported by the MPC cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Threshold ECDSA over secp256k1
    Ecdsa,
    /// Threshold EdDSA over ed25519
    Eddsa,
    /// Schnorr/Taproot over secp256k1
    Taproot,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Ecdsa => write!(f, "ecdsa"),
            KeyType::Eddsa => write!(f, "eddsa"),
            KeyType::Taproot => write!(f, "taproot"),
        }
    }
}

/// Liveness status of a cluster participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not reachable
    Offline,
    /// Healthy and eligible for key generation
    Online,
    /// Reachable but catching up; not eligible for new wallets
    Syncing,
    /// Reachable but reporting an internal fault
    Error,
}

/// Lifecycle status of a threshold wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    /// Created; distributed key generation has not completed
    Pending,
    /// Key material generated, addresses recorded, wallet usable
    Active,
    /// Key shares being refreshed
    Rotating,
    /// Soft-deleted; record retained for signing history
    Archived,
}

impl WalletStatus {
    /// Check whether a transition to `next` is allowed.
    ///
    /// Allowed: pending -> active, active -> rotating, rotating -> active,
    /// and any state -> archived. Archival is terminal.
    pub fn can_transition_to(&self, next: WalletStatus) -> bool {
        match (self, next) {
            (WalletStatus::Archived, _) => false,
            (_, WalletStatus::Archived) => true,
            (WalletStatus::Pending, WalletStatus::Active) => true,
            (WalletStatus::Active, WalletStatus::Rotating) => true,
            (WalletStatus::Rotating, WalletStatus::Active) => true,
            _ => false,
        }
    }
}

/// Lifecycle status of a signing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Created; approvers not yet notified
    Pending,
    /// Approval invitations dispatched; collecting decisions and shares
    Collecting,
    /// Quorum reached; share combination in progress (single writer)
    Signing,
    /// Combined signature produced
    Completed,
    /// Combination failed, quorum unreachable, or expired
    Failed,
    /// Cancelled by an actor while still collectable
    Cancelled,
}

impl RequestStatus {
    /// Terminal states are immutable; no path may resurrect them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// States from which cancellation and expiration are valid
    pub fn is_collectable(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Collecting)
    }
}

/// State of one approver's response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    /// Approver has been asked to act
    Pending,
    /// Approved, optionally carrying a signature share
    Approved,
    /// Rejected
    Rejected,
}

/// Identity of an approver. Exactly one of user or node; the serialized
/// tag is the approval-type discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "approval_type", content = "id", rename_all = "lowercase")]
pub enum Approver {
    /// A human approver, keyed by user id
    User(UserId),
    /// A cluster participant, keyed by node identifier
    Node(NodeId),
}

impl fmt::Display for Approver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Approver::User(id) => write!(f, "user:{id}"),
            Approver::Node(id) => write!(f, "node:{id}"),
        }
    }
}

/// A registered MPC cluster participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcNode {
    /// Row id
    pub id: String,
    /// Owning organization
    pub org_id: OrgId,
    /// Display name
    pub name: String,
    /// Network node identifier, unique per organization
    pub node_id: NodeId,
    /// Node public key (hex), if registered
    pub public_key: Option<String>,
    /// Reachable endpoint
    pub endpoint: Option<String>,
    /// Endpoint port
    pub port: u16,
    /// Liveness status; mutated only by health callbacks or admin update
    pub status: NodeStatus,
    /// Opaque metadata passthrough
    pub metadata: Metadata,
    /// Last health-check timestamp
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// A threshold-custody wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpcWallet {
    /// Row id
    pub id: String,
    /// Owning organization
    pub org_id: OrgId,
    /// Optional project scope
    pub project_id: Option<ProjectId>,
    /// Display name
    pub name: String,
    /// Generated wallet identifier, unique per organization
    pub wallet_id: WalletId,
    /// Signature scheme
    pub key_type: KeyType,
    /// Minimum participants required to sign (t)
    pub threshold: u16,
    /// Total key-share holders (n)
    pub total_parties: u16,
    /// Ordered participant node identifiers (references, not ownership)
    pub participant_node_ids: Vec<NodeId>,
    /// Aggregated public key (hex), present once DKG succeeds
    pub public_key: Option<String>,
    /// Lifecycle status
    pub status: WalletStatus,
    /// Chain -> derived address, present only once active
    pub chain_addresses: HashMap<Chain, String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl MpcWallet {
    /// Whether the wallet can accept new signing requests
    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }
}

/// One request to produce a signature over a transaction payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningRequest {
    /// Row id
    pub id: RequestId,
    /// Owning wallet (row id)
    pub wallet_id: String,
    /// Owning organization (denormalized for scoping)
    pub org_id: OrgId,
    /// Initiating actor, if a user started the request
    pub initiator_user_id: Option<UserId>,
    /// Target chain
    pub chain: Chain,
    /// Raw transaction payload (hex)
    pub raw_transaction: String,
    /// Decoded transaction detail, opaque to orchestration
    pub transaction_details: Option<serde_json::Value>,
    /// Lifecycle status
    pub status: RequestStatus,
    /// Number of approvals required before combination
    pub required_approvals: u16,
    /// Combined signature (hex), present once completed
    pub combined_signature: Option<String>,
    /// Broadcast transaction hash, present when a broadcaster was configured
    pub tx_hash: Option<String>,
    /// Error detail, present once failed
    pub error: Option<String>,
    /// Forced-failure deadline enforced by the sweep
    pub expires_at: DateTime<Utc>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Terminal-transition timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl SigningRequest {
    /// Check if the request is past its deadline
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// One approver's response to a signing request. Never deleted; the rows
/// are the audit trail even after cancellation or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningApproval {
    /// Row id
    pub id: ApprovalId,
    /// Owning request
    pub request_id: RequestId,
    /// Approver identity
    pub approver: Approver,
    /// Decision state; mutated once from pending to a terminal state
    pub state: ApprovalState,
    /// Signature share (hex), present only when approved with a share
    pub signature_share: Option<String>,
    /// Optional free-form comment
    pub comment: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Decision timestamp
    pub responded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_status_transitions() {
        assert!(WalletStatus::Pending.can_transition_to(WalletStatus::Active));
        assert!(WalletStatus::Active.can_transition_to(WalletStatus::Rotating));
        assert!(WalletStatus::Rotating.can_transition_to(WalletStatus::Active));
        assert!(WalletStatus::Pending.can_transition_to(WalletStatus::Archived));
        assert!(WalletStatus::Active.can_transition_to(WalletStatus::Archived));

        // Archival is terminal
        assert!(!WalletStatus::Archived.can_transition_to(WalletStatus::Active));
        assert!(!WalletStatus::Archived.can_transition_to(WalletStatus::Pending));

        // No shortcuts
        assert!(!WalletStatus::Pending.can_transition_to(WalletStatus::Rotating));
        assert!(!WalletStatus::Active.can_transition_to(WalletStatus::Pending));
    }

    #[test]
    fn test_request_status_terminality() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(RequestStatus::Cancelled.is_terminal());
        assert!(!RequestStatus::Signing.is_terminal());

        assert!(RequestStatus::Pending.is_collectable());
        assert!(RequestStatus::Collecting.is_collectable());
        assert!(!RequestStatus::Signing.is_collectable());
    }

    #[test]
    fn test_approver_serde_discriminator() {
        let user = Approver::User("u1".into());
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["approval_type"], "user");
        assert_eq!(json["id"], "u1");

        let node: Approver =
            serde_json::from_value(serde_json::json!({ "approval_type": "node", "id": "n1" }))
                .unwrap();
        assert_eq!(node, Approver::Node("n1".into()));
    }
}
