//! Threshold wallet registry
//!
//! Owns wallet rows and drives distributed key generation through the
//! cluster contract. Creation persists the wallet as `pending` before the
//! DKG run so the intermediate state stays observable; a failed run leaves
//! the wallet `pending` and retry is caller-driven. Repeated automatic
//! attempts against a partially-compromised node set must not happen
//! silently.

use crate::chain::{derive_addresses, Chain};
use crate::cluster::{KeygenSpec, MpcCluster};
use crate::store::{NodeStore, WalletStore};
use crate::types::{KeyType, MpcWallet, NodeStatus, WalletStatus};
use crate::{CustodyError, Result};
use chrono::Utc;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Parameters for creating a wallet
#[derive(Debug, Clone)]
pub struct CreateWallet {
    pub org_id: String,
    pub project_id: Option<String>,
    pub name: String,
    pub key_type: KeyType,
    /// Minimum signers `t`
    pub threshold: u16,
    /// Total key-share holders `n`
    pub total_parties: u16,
    pub participant_node_ids: Vec<String>,
}

/// Mutable wallet fields. Key configuration and participants are fixed at
/// creation; only presentation fields may change.
#[derive(Debug, Clone, Default)]
pub struct UpdateWallet {
    pub name: Option<String>,
    pub project_id: Option<String>,
}

/// Public key and derived addresses of an active wallet
#[derive(Debug, Clone)]
pub struct WalletAddresses {
    pub public_key: String,
    pub chain_addresses: HashMap<Chain, String>,
}

/// Registry of threshold-custody wallets
pub struct WalletRegistry {
    wallets: Arc<dyn WalletStore>,
    nodes: Arc<dyn NodeStore>,
    cluster: Arc<dyn MpcCluster>,
}

impl WalletRegistry {
    pub fn new(
        wallets: Arc<dyn WalletStore>,
        nodes: Arc<dyn NodeStore>,
        cluster: Arc<dyn MpcCluster>,
    ) -> Self {
        Self {
            wallets,
            nodes,
            cluster,
        }
    }

    /// Create a wallet and run distributed key generation.
    ///
    /// On a DKG failure the persisted wallet stays `pending` and the error
    /// surfaces to the caller; see [`WalletRegistry::retry_keygen`].
    #[instrument(skip(self, params), fields(org_id = %params.org_id, key_type = %params.key_type))]
    pub async fn create(&self, params: CreateWallet) -> Result<MpcWallet> {
        validate_threshold(params.threshold, params.total_parties)?;
        if params.participant_node_ids.len() != params.total_parties as usize {
            return Err(CustodyError::Invalid(format!(
                "{} participants listed for a {}-party wallet",
                params.participant_node_ids.len(),
                params.total_parties
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for node_id in &params.participant_node_ids {
            if !seen.insert(node_id.as_str()) {
                return Err(CustodyError::Invalid(format!(
                    "participant {node_id} listed twice"
                )));
            }
        }

        self.check_participants_online(&params.org_id, &params.participant_node_ids)
            .await?;

        let now = Utc::now();
        let wallet = MpcWallet {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: params.org_id,
            project_id: params.project_id,
            name: params.name,
            wallet_id: generate_wallet_id(),
            key_type: params.key_type,
            threshold: params.threshold,
            total_parties: params.total_parties,
            participant_node_ids: params.participant_node_ids,
            public_key: None,
            status: WalletStatus::Pending,
            chain_addresses: HashMap::new(),
            created_at: now,
            updated_at: now,
        };
        let wallet = self.wallets.insert(wallet).await?;
        info!(wallet_id = %wallet.wallet_id, "wallet created, starting key generation");

        self.run_dkg(wallet).await
    }

    /// Re-run key generation for a wallet left `pending` by a failed run.
    /// Participants are re-checked against the current online snapshot.
    #[instrument(skip(self), fields(org_id = %org_id, id = %id))]
    pub async fn retry_keygen(&self, org_id: &str, id: &str) -> Result<MpcWallet> {
        let wallet = self.get(org_id, id).await?;
        if wallet.status != WalletStatus::Pending {
            return Err(CustodyError::PreconditionFailed(format!(
                "wallet {} is not pending key generation",
                wallet.wallet_id
            )));
        }

        self.check_participants_online(org_id, &wallet.participant_node_ids)
            .await?;
        self.run_dkg(wallet).await
    }

    /// Fetch a wallet, scoped to the calling organization
    pub async fn get(&self, org_id: &str, id: &str) -> Result<MpcWallet> {
        match self.wallets.find_by_id(id).await? {
            Some(wallet) if wallet.org_id == org_id => Ok(wallet),
            _ => Err(CustodyError::NotFound(format!("wallet {id}"))),
        }
    }

    /// List wallets in an organization, optionally narrowed to a project
    pub async fn list(&self, org_id: &str, project_id: Option<&str>) -> Result<Vec<MpcWallet>> {
        let wallets = match project_id {
            Some(project) => self.wallets.list_by_project(project).await?,
            None => self.wallets.list_by_org(org_id).await?,
        };
        Ok(wallets.into_iter().filter(|w| w.org_id == org_id).collect())
    }

    /// Update presentation fields
    pub async fn update(&self, org_id: &str, id: &str, fields: UpdateWallet) -> Result<MpcWallet> {
        let mut wallet = self.get(org_id, id).await?;

        if let Some(name) = fields.name {
            wallet.name = name;
        }
        if let Some(project_id) = fields.project_id {
            wallet.project_id = Some(project_id);
        }
        wallet.updated_at = Utc::now();

        self.wallets.update(wallet).await
    }

    /// Archive a wallet. Deletion is soft; the record is retained for
    /// signing history and archival is terminal.
    #[instrument(skip(self), fields(org_id = %org_id, id = %id))]
    pub async fn delete(&self, org_id: &str, id: &str) -> Result<MpcWallet> {
        let mut wallet = self.get(org_id, id).await?;
        if wallet.status == WalletStatus::Archived {
            return Err(CustodyError::PreconditionFailed(format!(
                "wallet {} is already archived",
                wallet.wallet_id
            )));
        }

        wallet.status = WalletStatus::Archived;
        wallet.updated_at = Utc::now();
        let wallet = self.wallets.update(wallet).await?;
        info!(wallet_id = %wallet.wallet_id, "wallet archived");
        Ok(wallet)
    }

    /// Public key and chain addresses. Exposed only once the wallet is
    /// `active`; no partial address data is ever returned.
    pub async fn get_addresses(&self, org_id: &str, id: &str) -> Result<WalletAddresses> {
        let wallet = self.get(org_id, id).await?;
        match (wallet.is_active(), wallet.public_key) {
            (true, Some(public_key)) => Ok(WalletAddresses {
                public_key,
                chain_addresses: wallet.chain_addresses,
            }),
            _ => Err(CustodyError::PreconditionFailed(format!(
                "wallet {} has no active key material",
                wallet.wallet_id
            ))),
        }
    }

    async fn check_participants_online(&self, org_id: &str, participants: &[String]) -> Result<()> {
        let online: std::collections::HashSet<String> = self
            .nodes
            .list_by_org(org_id)
            .await?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online)
            .map(|n| n.node_id)
            .collect();

        let missing: Vec<&str> = participants
            .iter()
            .filter(|id| !online.contains(id.as_str()))
            .map(|id| id.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CustodyError::PreconditionFailed(format!(
                "participants not online: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    async fn run_dkg(&self, mut wallet: MpcWallet) -> Result<MpcWallet> {
        let spec = KeygenSpec {
            wallet_id: wallet.wallet_id.clone(),
            key_type: wallet.key_type,
            threshold: wallet.threshold,
            participant_node_ids: wallet.participant_node_ids.clone(),
        };

        let outcome = match self.cluster.run_keygen(&spec).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(wallet_id = %wallet.wallet_id, error = %err, "key generation failed, wallet stays pending");
                return Err(err);
            }
        };

        wallet.chain_addresses = derive_addresses(wallet.key_type, &outcome.public_key)?;
        wallet.public_key = Some(hex::encode(&outcome.public_key));
        wallet.status = WalletStatus::Active;
        wallet.updated_at = Utc::now();

        let wallet = self.wallets.update(wallet).await?;
        info!(wallet_id = %wallet.wallet_id, "wallet active");
        Ok(wallet)
    }
}

fn validate_threshold(threshold: u16, total_parties: u16) -> Result<()> {
    if threshold < 1 || threshold >= total_parties {
        return Err(CustodyError::Invalid(format!(
            "threshold must satisfy 1 <= t < n, got t={threshold} n={total_parties}"
        )));
    }
    Ok(())
}

/// Generated wallet identifier: 16 bytes of entropy, collision-checked by
/// the store's uniqueness constraint
fn generate_wallet_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("wallet_{}", hex::encode(bytes))
}
