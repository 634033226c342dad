//! Storage abstraction for custody entities
//!
//! The traits here are the persistence seam: the orchestration services only
//! talk to these interfaces, so a relational backend can replace the
//! in-memory implementations without touching the state machines. Storage
//! implementations wrap their native failures into
//! [`CustodyError::Database`] before returning.
//!
//! The signing store's [`SigningStore::transition_request`] is the
//! single-writer gate: it performs a compare-and-swap on the request status
//! so concurrent callers racing on the same transition get exactly one
//! winner.

use crate::types::{
    ApprovalState, Approver, MpcNode, MpcWallet, NodeStatus, RequestStatus,
    SigningApproval, SigningRequest, WalletStatus,
};
use crate::{CustodyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Storage for MPC cluster participants
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert a node. Fails with `Conflict` if `(org_id, node_id)` exists.
    async fn insert(&self, node: MpcNode) -> Result<MpcNode>;

    /// Replace a node row keyed by its row id
    async fn update(&self, node: MpcNode) -> Result<MpcNode>;

    /// Find a node by row id
    async fn find_by_id(&self, id: &str) -> Result<Option<MpcNode>>;

    /// Find a node by its network identifier within an organization
    async fn find_by_node_id(&self, org_id: &str, node_id: &str) -> Result<Option<MpcNode>>;

    /// List all nodes owned by an organization
    async fn list_by_org(&self, org_id: &str) -> Result<Vec<MpcNode>>;

    /// Set liveness status and last-seen timestamp. Idempotent: a repeat
    /// call with the same status and timestamp leaves the row untouched,
    /// `updated_at` included.
    async fn set_status(
        &self,
        id: &str,
        status: NodeStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<MpcNode>;

    /// Physically remove a node row
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Storage for threshold wallets
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Insert a wallet. Fails with `Conflict` if `(org_id, wallet_id)` exists.
    async fn insert(&self, wallet: MpcWallet) -> Result<MpcWallet>;

    /// Replace a wallet row keyed by its row id
    async fn update(&self, wallet: MpcWallet) -> Result<MpcWallet>;

    /// Find a wallet by row id
    async fn find_by_id(&self, id: &str) -> Result<Option<MpcWallet>>;

    /// List wallets owned by an organization
    async fn list_by_org(&self, org_id: &str) -> Result<Vec<MpcWallet>>;

    /// List wallets scoped to a project
    async fn list_by_project(&self, project_id: &str) -> Result<Vec<MpcWallet>>;

    /// Non-archived wallets in the organization that reference `node_id`
    /// in their participant list
    async fn find_referencing_node(&self, org_id: &str, node_id: &str) -> Result<Vec<MpcWallet>>;
}

/// Fields applied atomically with a request status transition
#[derive(Debug, Clone, Default)]
pub struct RequestPatch {
    pub combined_signature: Option<String>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

/// Storage for signing requests and their approvals
#[async_trait]
pub trait SigningStore: Send + Sync {
    /// Insert a signing request
    async fn insert_request(&self, request: SigningRequest) -> Result<SigningRequest>;

    /// Find a request by row id
    async fn find_request(&self, id: &str) -> Result<Option<SigningRequest>>;

    /// List requests for an organization, optionally filtered
    async fn list_requests(
        &self,
        org_id: &str,
        wallet_id: Option<&str>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<SigningRequest>>;

    /// Compare-and-swap status transition. Applies `patch` and returns
    /// `Ok(true)` only if the request was in `from`; a caller observing
    /// `Ok(false)` lost the race and must not re-run the transition's
    /// side effects.
    async fn transition_request(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        patch: RequestPatch,
    ) -> Result<bool>;

    /// Non-terminal requests whose deadline has passed
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SigningRequest>>;

    /// Insert an approval row. Fails with `Conflict` if one already exists
    /// for `(request_id, approver)`.
    async fn insert_approval(&self, approval: SigningApproval) -> Result<SigningApproval>;

    /// All approval rows for a request
    async fn list_approvals(&self, request_id: &str) -> Result<Vec<SigningApproval>>;

    /// Record an approver's decision. The row moves from `Pending` to
    /// `state` exactly once; fails with `Conflict` if already decided.
    ///
    /// The write is atomic with the request status: once the request has
    /// left `collecting` (a combiner won the transition, or the request was
    /// cancelled or expired), the decision fails with `PreconditionFailed`
    /// instead of landing late in the audit trail. A relational backend
    /// must apply the same guard in the decision's transaction.
    async fn decide_approval(
        &self,
        request_id: &str,
        approver: &Approver,
        state: ApprovalState,
        signature_share: Option<String>,
        comment: Option<String>,
    ) -> Result<SigningApproval>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory node store for tests and local development
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: DashMap<String, MpcNode>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn insert(&self, node: MpcNode) -> Result<MpcNode> {
        let duplicate = self
            .nodes
            .iter()
            .any(|e| e.org_id == node.org_id && e.node_id == node.node_id);
        if duplicate {
            return Err(CustodyError::Conflict(format!(
                "node {} already registered in organization {}",
                node.node_id, node.org_id
            )));
        }
        self.nodes.insert(node.id.clone(), node.clone());
        Ok(node)
    }

    async fn update(&self, node: MpcNode) -> Result<MpcNode> {
        match self.nodes.get_mut(&node.id) {
            Some(mut entry) => {
                *entry = node.clone();
                Ok(node)
            }
            None => Err(CustodyError::NotFound(format!("node {}", node.id))),
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<MpcNode>> {
        Ok(self.nodes.get(id).map(|e| e.value().clone()))
    }

    async fn find_by_node_id(&self, org_id: &str, node_id: &str) -> Result<Option<MpcNode>> {
        Ok(self
            .nodes
            .iter()
            .find(|e| e.org_id == org_id && e.node_id == node_id)
            .map(|e| e.value().clone()))
    }

    async fn list_by_org(&self, org_id: &str) -> Result<Vec<MpcNode>> {
        Ok(self
            .nodes
            .iter()
            .filter(|e| e.org_id == org_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn set_status(
        &self,
        id: &str,
        status: NodeStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<MpcNode> {
        match self.nodes.get_mut(id) {
            Some(mut entry) => {
                // Replaying the same health result must not touch the row
                if entry.status == status && entry.last_seen_at == Some(seen_at) {
                    return Ok(entry.value().clone());
                }
                entry.status = status;
                entry.last_seen_at = Some(seen_at);
                entry.updated_at = Utc::now();
                Ok(entry.value().clone())
            }
            None => Err(CustodyError::NotFound(format!("node {id}"))),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.nodes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CustodyError::NotFound(format!("node {id}")))
    }
}

/// In-memory wallet store for tests and local development
#[derive(Debug, Default)]
pub struct MemoryWalletStore {
    wallets: DashMap<String, MpcWallet>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn insert(&self, wallet: MpcWallet) -> Result<MpcWallet> {
        let duplicate = self
            .wallets
            .iter()
            .any(|e| e.org_id == wallet.org_id && e.wallet_id == wallet.wallet_id);
        if duplicate {
            return Err(CustodyError::Conflict(format!(
                "wallet {} already exists in organization {}",
                wallet.wallet_id, wallet.org_id
            )));
        }
        self.wallets.insert(wallet.id.clone(), wallet.clone());
        Ok(wallet)
    }

    async fn update(&self, wallet: MpcWallet) -> Result<MpcWallet> {
        match self.wallets.get_mut(&wallet.id) {
            Some(mut entry) => {
                *entry = wallet.clone();
                Ok(wallet)
            }
            None => Err(CustodyError::NotFound(format!("wallet {}", wallet.id))),
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<MpcWallet>> {
        Ok(self.wallets.get(id).map(|e| e.value().clone()))
    }

    async fn list_by_org(&self, org_id: &str) -> Result<Vec<MpcWallet>> {
        Ok(self
            .wallets
            .iter()
            .filter(|e| e.org_id == org_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<MpcWallet>> {
        Ok(self
            .wallets
            .iter()
            .filter(|e| e.project_id.as_deref() == Some(project_id))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn find_referencing_node(&self, org_id: &str, node_id: &str) -> Result<Vec<MpcWallet>> {
        Ok(self
            .wallets
            .iter()
            .filter(|e| {
                e.org_id == org_id
                    && e.status != WalletStatus::Archived
                    && e.participant_node_ids.iter().any(|n| n == node_id)
            })
            .map(|e| e.value().clone())
            .collect())
    }
}

/// In-memory signing store for tests and local development.
///
/// `transition_request` relies on `DashMap::get_mut` holding the shard lock
/// for the duration of the check-and-set, which makes the CAS atomic.
#[derive(Debug, Default)]
pub struct MemorySigningStore {
    requests: DashMap<String, SigningRequest>,
    /// Approvals keyed by request id
    approvals: DashMap<String, Vec<SigningApproval>>,
}

impl MemorySigningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SigningStore for MemorySigningStore {
    async fn insert_request(&self, request: SigningRequest) -> Result<SigningRequest> {
        self.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn find_request(&self, id: &str) -> Result<Option<SigningRequest>> {
        Ok(self.requests.get(id).map(|e| e.value().clone()))
    }

    async fn list_requests(
        &self,
        org_id: &str,
        wallet_id: Option<&str>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<SigningRequest>> {
        Ok(self
            .requests
            .iter()
            .filter(|e| e.org_id == org_id)
            .filter(|e| wallet_id.map(|w| e.wallet_id == w).unwrap_or(true))
            .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn transition_request(
        &self,
        id: &str,
        from: RequestStatus,
        to: RequestStatus,
        patch: RequestPatch,
    ) -> Result<bool> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| CustodyError::NotFound(format!("signing request {id}")))?;

        if entry.status != from {
            return Ok(false);
        }

        entry.status = to;
        if let Some(sig) = patch.combined_signature {
            entry.combined_signature = Some(sig);
        }
        if let Some(hash) = patch.tx_hash {
            entry.tx_hash = Some(hash);
        }
        if let Some(error) = patch.error {
            entry.error = Some(error);
        }
        if to.is_terminal() {
            entry.completed_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SigningRequest>> {
        Ok(self
            .requests
            .iter()
            .filter(|e| !e.status.is_terminal() && e.expires_at <= now)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn insert_approval(&self, approval: SigningApproval) -> Result<SigningApproval> {
        let mut rows = self.approvals.entry(approval.request_id.clone()).or_default();
        if rows.iter().any(|a| a.approver == approval.approver) {
            return Err(CustodyError::Conflict(format!(
                "approval already exists for {} on request {}",
                approval.approver, approval.request_id
            )));
        }
        rows.push(approval.clone());
        Ok(approval)
    }

    async fn list_approvals(&self, request_id: &str) -> Result<Vec<SigningApproval>> {
        Ok(self
            .approvals
            .get(request_id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn decide_approval(
        &self,
        request_id: &str,
        approver: &Approver,
        state: ApprovalState,
        signature_share: Option<String>,
        comment: Option<String>,
    ) -> Result<SigningApproval> {
        // Holding the request entry lock serializes this write against
        // `transition_request`, so no decision lands after the request
        // leaves `collecting`.
        let request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| CustodyError::NotFound(format!("signing request {request_id}")))?;
        if request.status != RequestStatus::Collecting {
            return Err(CustodyError::PreconditionFailed(format!(
                "signing request {request_id} is not collecting approvals"
            )));
        }

        let mut rows = self
            .approvals
            .get_mut(request_id)
            .ok_or_else(|| CustodyError::NotFound(format!("signing request {request_id}")))?;

        let row = rows
            .iter_mut()
            .find(|a| &a.approver == approver)
            .ok_or_else(|| {
                CustodyError::NotFound(format!("{approver} was not invited to {request_id}"))
            })?;

        if row.state != ApprovalState::Pending {
            return Err(CustodyError::Conflict(format!(
                "{approver} already responded to request {request_id}"
            )));
        }

        row.state = state;
        row.signature_share = signature_share;
        row.comment = comment;
        row.responded_at = Some(Utc::now());
        Ok(row.clone())
    }
}
