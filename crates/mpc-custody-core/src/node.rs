//! MPC node registry
//!
//! Tracks cluster participant identity, liveness, and reachability. Status
//! is mutated only by health callbacks (`record_health`) or administrative
//! update; user-facing callers never write it directly.

use crate::store::{NodeStore, WalletStore};
use crate::types::{Metadata, MpcNode, NodeStatus};
use crate::{CustodyError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Default endpoint port when a registration omits one
pub const DEFAULT_NODE_PORT: u16 = 8080;

/// Parameters for registering a node
#[derive(Debug, Clone)]
pub struct RegisterNode {
    pub org_id: String,
    pub name: String,
    pub node_id: String,
    pub public_key: Option<String>,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub metadata: Metadata,
}

/// Administrative field updates; `None` leaves the field unchanged
#[derive(Debug, Clone, Default)]
pub struct UpdateNode {
    pub name: Option<String>,
    pub public_key: Option<String>,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub status: Option<NodeStatus>,
    pub metadata: Option<Metadata>,
}

/// Registry of MPC cluster participants
pub struct NodeRegistry {
    nodes: Arc<dyn NodeStore>,
    wallets: Arc<dyn WalletStore>,
}

impl NodeRegistry {
    pub fn new(nodes: Arc<dyn NodeStore>, wallets: Arc<dyn WalletStore>) -> Self {
        Self { nodes, wallets }
    }

    /// Register a new cluster participant. New nodes start `offline` until
    /// the first health callback promotes them.
    #[instrument(skip(self, params), fields(org_id = %params.org_id, node_id = %params.node_id))]
    pub async fn register(&self, params: RegisterNode) -> Result<MpcNode> {
        if params.node_id.trim().is_empty() {
            return Err(CustodyError::Invalid("node identifier is empty".into()));
        }

        let now = Utc::now();
        let node = MpcNode {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: params.org_id,
            name: params.name,
            node_id: params.node_id,
            public_key: params.public_key,
            endpoint: params.endpoint,
            port: params.port.unwrap_or(DEFAULT_NODE_PORT),
            status: NodeStatus::Offline,
            metadata: params.metadata,
            last_seen_at: None,
            created_at: now,
            updated_at: now,
        };

        let node = self.nodes.insert(node).await?;
        info!(id = %node.id, "registered mpc node");
        Ok(node)
    }

    /// Fetch a node, scoped to the calling organization
    pub async fn get(&self, org_id: &str, id: &str) -> Result<MpcNode> {
        match self.nodes.find_by_id(id).await? {
            Some(node) if node.org_id == org_id => Ok(node),
            _ => Err(CustodyError::NotFound(format!("node {id}"))),
        }
    }

    /// List all nodes in an organization
    pub async fn list(&self, org_id: &str) -> Result<Vec<MpcNode>> {
        self.nodes.list_by_org(org_id).await
    }

    /// Snapshot of nodes currently `online`, used as the eligibility filter
    /// during wallet creation
    pub async fn list_online(&self, org_id: &str) -> Result<Vec<MpcNode>> {
        Ok(self
            .nodes
            .list_by_org(org_id)
            .await?
            .into_iter()
            .filter(|n| n.status == NodeStatus::Online)
            .collect())
    }

    /// Apply administrative field updates
    #[instrument(skip(self, fields), fields(org_id = %org_id, id = %id))]
    pub async fn update(&self, org_id: &str, id: &str, fields: UpdateNode) -> Result<MpcNode> {
        let mut node = self.get(org_id, id).await?;

        if let Some(name) = fields.name {
            node.name = name;
        }
        if let Some(public_key) = fields.public_key {
            node.public_key = Some(public_key);
        }
        if let Some(endpoint) = fields.endpoint {
            node.endpoint = Some(endpoint);
        }
        if let Some(port) = fields.port {
            node.port = port;
        }
        if let Some(status) = fields.status {
            node.status = status;
        }
        if let Some(metadata) = fields.metadata {
            node.metadata = metadata;
        }
        node.updated_at = Utc::now();

        self.nodes.update(node).await
    }

    /// Delete a node. Refused while any non-archived wallet references it.
    #[instrument(skip(self), fields(org_id = %org_id, id = %id))]
    pub async fn delete(&self, org_id: &str, id: &str) -> Result<()> {
        let node = self.get(org_id, id).await?;

        let referencing = self
            .wallets
            .find_referencing_node(org_id, &node.node_id)
            .await?;
        if !referencing.is_empty() {
            let names: Vec<&str> = referencing.iter().map(|w| w.wallet_id.as_str()).collect();
            return Err(CustodyError::Conflict(format!(
                "node {} is a participant in wallets: {}",
                node.node_id,
                names.join(", ")
            )));
        }

        self.nodes.delete(id).await?;
        info!(node_id = %node.node_id, "deleted mpc node");
        Ok(())
    }

    /// Record a health-check result. Idempotent upsert of status and
    /// last-seen; called by the health-check collaborator, never by
    /// user-facing callers.
    pub async fn record_health(
        &self,
        id: &str,
        status: NodeStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<MpcNode> {
        let node = self.nodes.set_status(id, status, seen_at).await?;
        debug!(id = %id, status = ?status, "recorded node health");
        Ok(node)
    }
}
