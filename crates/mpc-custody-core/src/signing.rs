//! Signing request orchestration
//!
//! Drives a request through `pending -> collecting -> signing ->
//! {completed | failed | cancelled}`. The `collecting -> signing` edge is a
//! compare-and-swap on the stored status: concurrent approval submissions
//! that reach quorum together get exactly one winner, and only the winner
//! runs share combination. Losers observe the moved state and return
//! without re-combining.

use crate::chain::Chain;
use crate::cluster::{CombineRequest, MpcCluster, SignatureShare};
use crate::notify::ApprovalNotifier;
use crate::store::{RequestPatch, SigningStore, WalletStore};
use crate::types::{
    ApprovalState, Approver, MpcWallet, RequestStatus, SigningApproval, SigningRequest, UserId,
};
use crate::webhook::WebhookService;
use crate::{CustodyError, Result};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Parameters for creating a signing request
#[derive(Debug, Clone)]
pub struct CreateSigningRequest {
    pub org_id: String,
    /// Wallet row id
    pub wallet_id: String,
    pub initiator_user_id: Option<UserId>,
    pub chain: Chain,
    /// Raw transaction payload (hex)
    pub raw_transaction: String,
    /// Decoded transaction detail, stored as opaque passthrough
    pub transaction_details: Option<serde_json::Value>,
    /// Approver set to invite
    pub approvers: Vec<Approver>,
    /// Approvals required before combination
    pub required_approvals: u16,
    /// Time allowed before the sweep forces failure
    pub ttl: Duration,
}

/// One approver's decision
#[derive(Debug, Clone)]
pub enum ApprovalResponse {
    Approve {
        /// Signature share (hex) when the approver contributes one
        signature_share: Option<String>,
        comment: Option<String>,
    },
    Reject {
        comment: Option<String>,
    },
}

/// Submits a combined signature to the target chain
#[async_trait::async_trait]
pub trait ChainBroadcaster: Send + Sync {
    /// Broadcast and return the resulting transaction hash
    async fn broadcast(
        &self,
        chain: Chain,
        raw_transaction: &str,
        signature: &str,
    ) -> Result<String>;
}

/// Orchestrates signing requests for active wallets
pub struct SigningOrchestrator {
    requests: Arc<dyn SigningStore>,
    wallets: Arc<dyn WalletStore>,
    cluster: Arc<dyn MpcCluster>,
    notifier: Arc<dyn ApprovalNotifier>,
    webhooks: Arc<WebhookService>,
    broadcaster: Option<Arc<dyn ChainBroadcaster>>,
}

impl SigningOrchestrator {
    pub fn new(
        requests: Arc<dyn SigningStore>,
        wallets: Arc<dyn WalletStore>,
        cluster: Arc<dyn MpcCluster>,
        notifier: Arc<dyn ApprovalNotifier>,
        webhooks: Arc<WebhookService>,
    ) -> Self {
        Self {
            requests,
            wallets,
            cluster,
            notifier,
            webhooks,
            broadcaster: None,
        }
    }

    /// Attach a broadcast collaborator; without one, completed requests
    /// carry a signature but no transaction hash
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn ChainBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Create a signing request and dispatch approval invitations.
    ///
    /// The request is persisted `pending`, invitations go out, and the
    /// status moves to `collecting`.
    #[instrument(skip(self, params), fields(org_id = %params.org_id, wallet_id = %params.wallet_id))]
    pub async fn create(&self, params: CreateSigningRequest) -> Result<SigningRequest> {
        let wallet = self.wallet_scoped(&params.org_id, &params.wallet_id).await?;
        if !wallet.is_active() {
            return Err(CustodyError::PreconditionFailed(format!(
                "wallet {} is not active",
                wallet.wallet_id
            )));
        }
        if !Chain::supported_for(wallet.key_type).contains(&params.chain) {
            return Err(CustodyError::Invalid(format!(
                "chain {} is not supported by a {} wallet",
                params.chain, wallet.key_type
            )));
        }
        let payload = hex::decode(&params.raw_transaction)?;
        if payload.is_empty() {
            return Err(CustodyError::Invalid("raw transaction is empty".into()));
        }

        // Fewer approvals than the cryptographic threshold can never
        // combine; more than the party count can never be collected.
        if params.required_approvals < wallet.threshold
            || params.required_approvals > wallet.total_parties
        {
            return Err(CustodyError::Invalid(format!(
                "required approvals must be between threshold {} and party count {}",
                wallet.threshold, wallet.total_parties
            )));
        }
        if params.required_approvals != wallet.threshold {
            warn!(
                required = params.required_approvals,
                threshold = wallet.threshold,
                "approval quorum differs from cryptographic threshold"
            );
        }

        if params.approvers.is_empty() {
            return Err(CustodyError::Invalid("no approvers selected".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for approver in &params.approvers {
            if !seen.insert(approver.to_string()) {
                return Err(CustodyError::Invalid(format!(
                    "approver {approver} listed twice"
                )));
            }
        }
        if (params.approvers.len() as u16) < params.required_approvals {
            return Err(CustodyError::Invalid(format!(
                "{} approvers invited but {} approvals required",
                params.approvers.len(),
                params.required_approvals
            )));
        }

        let now = Utc::now();
        let request = SigningRequest {
            id: uuid::Uuid::new_v4().to_string(),
            wallet_id: wallet.id.clone(),
            org_id: params.org_id,
            initiator_user_id: params.initiator_user_id,
            chain: params.chain,
            raw_transaction: params.raw_transaction,
            transaction_details: params.transaction_details,
            status: RequestStatus::Pending,
            required_approvals: params.required_approvals,
            combined_signature: None,
            tx_hash: None,
            error: None,
            expires_at: now + params.ttl,
            created_at: now,
            completed_at: None,
        };
        let request = self.requests.insert_request(request).await?;

        for approver in &params.approvers {
            self.requests
                .insert_approval(SigningApproval {
                    id: uuid::Uuid::new_v4().to_string(),
                    request_id: request.id.clone(),
                    approver: approver.clone(),
                    state: ApprovalState::Pending,
                    signature_share: None,
                    comment: None,
                    created_at: now,
                    responded_at: None,
                })
                .await?;
        }

        self.notifier
            .notify_approvers(&request, &params.approvers)
            .await?;

        self.requests
            .transition_request(
                &request.id,
                RequestStatus::Pending,
                RequestStatus::Collecting,
                RequestPatch::default(),
            )
            .await?;
        info!(request_id = %request.id, "signing request collecting approvals");

        self.refreshed(&request.id).await
    }

    /// Fetch a request, scoped to the calling organization
    pub async fn get(&self, org_id: &str, id: &str) -> Result<SigningRequest> {
        match self.requests.find_request(id).await? {
            Some(request) if request.org_id == org_id => Ok(request),
            _ => Err(CustodyError::NotFound(format!("signing request {id}"))),
        }
    }

    /// List requests, optionally filtered by wallet and status
    pub async fn list(
        &self,
        org_id: &str,
        wallet_id: Option<&str>,
        status: Option<RequestStatus>,
    ) -> Result<Vec<SigningRequest>> {
        self.requests.list_requests(org_id, wallet_id, status).await
    }

    /// Approval rows for a request (the audit trail)
    pub async fn approvals(&self, org_id: &str, request_id: &str) -> Result<Vec<SigningApproval>> {
        self.get(org_id, request_id).await?;
        self.requests.list_approvals(request_id).await
    }

    /// Record an approver's decision.
    ///
    /// A rejection fails the request only once quorum becomes unreachable
    /// (`approved + still_pending < required`). An approval that completes
    /// the quorum triggers combination exactly once; concurrent submissions
    /// race on the status compare-and-swap.
    #[instrument(skip(self, response), fields(request_id = %request_id, approver = %approver))]
    pub async fn submit_approval(
        &self,
        org_id: &str,
        request_id: &str,
        approver: &Approver,
        response: ApprovalResponse,
    ) -> Result<SigningRequest> {
        let request = self.get(org_id, request_id).await?;
        if request.status != RequestStatus::Collecting {
            return Err(CustodyError::PreconditionFailed(format!(
                "signing request {request_id} is not collecting approvals"
            )));
        }

        let (state, share, comment) = match response {
            ApprovalResponse::Approve {
                signature_share,
                comment,
            } => (ApprovalState::Approved, signature_share, comment),
            ApprovalResponse::Reject { comment } => (ApprovalState::Rejected, None, comment),
        };
        self.requests
            .decide_approval(request_id, approver, state, share, comment)
            .await?;

        let approvals = self.requests.list_approvals(request_id).await?;
        let approved = approvals
            .iter()
            .filter(|a| a.state == ApprovalState::Approved)
            .count() as u16;
        let still_pending = approvals
            .iter()
            .filter(|a| a.state == ApprovalState::Pending)
            .count() as u16;

        if approved >= request.required_approvals {
            return self.try_combine(&request, &approvals).await;
        }

        if approved + still_pending < request.required_approvals {
            // Quorum is mathematically unreachable
            let moved = self
                .requests
                .transition_request(
                    request_id,
                    RequestStatus::Collecting,
                    RequestStatus::Failed,
                    RequestPatch {
                        error: Some(format!(
                            "quorum unreachable: {approved} approved, {still_pending} pending, {} required",
                            request.required_approvals
                        )),
                        ..Default::default()
                    },
                )
                .await?;
            if moved {
                let request = self.refreshed(request_id).await?;
                warn!(request_id = %request_id, "signing request failed, quorum unreachable");
                self.webhooks.notify_terminal(&request).await;
                return Ok(request);
            }
        }

        self.refreshed(request_id).await
    }

    /// Cancel a request that is still collectable
    #[instrument(skip(self), fields(request_id = %request_id, actor = %actor))]
    pub async fn cancel(&self, org_id: &str, request_id: &str, actor: &str) -> Result<SigningRequest> {
        let request = self.get(org_id, request_id).await?;
        if !request.status.is_collectable() {
            return Err(CustodyError::PreconditionFailed(format!(
                "signing request {request_id} can no longer be cancelled"
            )));
        }

        let moved = self
            .requests
            .transition_request(
                request_id,
                request.status,
                RequestStatus::Cancelled,
                RequestPatch {
                    error: Some(format!("cancelled by {actor}")),
                    ..Default::default()
                },
            )
            .await?;
        if !moved {
            return Err(CustodyError::PreconditionFailed(format!(
                "signing request {request_id} can no longer be cancelled"
            )));
        }

        let request = self.refreshed(request_id).await?;
        info!(request_id = %request_id, "signing request cancelled");
        self.webhooks.notify_terminal(&request).await;
        Ok(request)
    }

    /// Force a request past its deadline to `failed`. Called by the sweep;
    /// a no-op `Ok(false)` when the request already moved on.
    pub async fn expire(&self, request_id: &str) -> Result<bool> {
        let request = self
            .requests
            .find_request(request_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("signing request {request_id}")))?;

        if !request.status.is_collectable() || !request.is_expired() {
            return Ok(false);
        }

        let moved = self
            .requests
            .transition_request(
                request_id,
                request.status,
                RequestStatus::Failed,
                RequestPatch {
                    error: Some("expired before reaching quorum".into()),
                    ..Default::default()
                },
            )
            .await?;
        if moved {
            let request = self.refreshed(request_id).await?;
            warn!(request_id = %request_id, "signing request expired");
            self.webhooks.notify_terminal(&request).await;
        }
        Ok(moved)
    }

    /// Expire every overdue collectable request; returns how many moved
    pub async fn sweep_expired(&self) -> Result<usize> {
        let due = self.requests.list_expired(Utc::now()).await?;
        let mut expired = 0;
        for request in due {
            if self.expire(&request.id).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Take the `collecting -> signing` edge and, on winning, run share
    /// combination and finish the request.
    async fn try_combine(
        &self,
        request: &SigningRequest,
        approvals: &[SigningApproval],
    ) -> Result<SigningRequest> {
        let won = self
            .requests
            .transition_request(
                &request.id,
                RequestStatus::Collecting,
                RequestStatus::Signing,
                RequestPatch::default(),
            )
            .await?;
        if !won {
            // Another submission got here first
            return self.refreshed(&request.id).await;
        }

        let outcome = self.combine(request, approvals).await;
        let (to, patch) = match outcome {
            Ok((signature, tx_hash)) => (
                RequestStatus::Completed,
                RequestPatch {
                    combined_signature: Some(signature),
                    tx_hash,
                    error: None,
                },
            ),
            Err(err) => (
                RequestStatus::Failed,
                RequestPatch {
                    error: Some(err.to_string()),
                    ..Default::default()
                },
            ),
        };

        self.requests
            .transition_request(&request.id, RequestStatus::Signing, to, patch)
            .await?;
        let request = self.refreshed(&request.id).await?;
        info!(request_id = %request.id, status = ?request.status, "signing request resolved");
        self.webhooks.notify_terminal(&request).await;
        Ok(request)
    }

    async fn combine(
        &self,
        request: &SigningRequest,
        approvals: &[SigningApproval],
    ) -> Result<(String, Option<String>)> {
        let wallet = self.wallet_scoped(&request.org_id, &request.wallet_id).await?;
        let public_key = wallet
            .public_key
            .as_deref()
            .ok_or_else(|| CustodyError::Internal("active wallet without public key".into()))?;

        let shares: Vec<SignatureShare> = approvals
            .iter()
            .filter(|a| a.state == ApprovalState::Approved)
            .filter_map(|a| {
                a.signature_share.as_ref().map(|payload| SignatureShare {
                    node_id: match &a.approver {
                        Approver::Node(id) | Approver::User(id) => id.clone(),
                    },
                    payload: payload.clone(),
                })
            })
            .collect();

        let combined = self
            .cluster
            .combine_shares(&CombineRequest {
                wallet_id: wallet.wallet_id.clone(),
                key_type: wallet.key_type,
                public_key: hex::decode(public_key)?,
                message: hex::decode(&request.raw_transaction)?,
                threshold: wallet.threshold,
                shares,
            })
            .await?;

        let tx_hash = match &self.broadcaster {
            Some(broadcaster) => Some(
                broadcaster
                    .broadcast(request.chain, &request.raw_transaction, &combined.signature)
                    .await?,
            ),
            None => None,
        };
        Ok((combined.signature, tx_hash))
    }

    async fn wallet_scoped(&self, org_id: &str, id: &str) -> Result<MpcWallet> {
        match self.wallets.find_by_id(id).await? {
            Some(wallet) if wallet.org_id == org_id => Ok(wallet),
            _ => Err(CustodyError::NotFound(format!("wallet {id}"))),
        }
    }

    async fn refreshed(&self, request_id: &str) -> Result<SigningRequest> {
        self.requests
            .find_request(request_id)
            .await?
            .ok_or_else(|| CustodyError::NotFound(format!("signing request {request_id}")))
    }
}
