//! # MPC Custody Core
//!
//! Orchestration layer for threshold-custody wallets: node and wallet
//! registries, the signing-request state machine, and the contract with an
//! external MPC computation cluster.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Node Registry**: cluster participant identity, liveness, reachability
//! - **Wallet Registry**: t-of-n wallets, distributed key generation
//!   orchestration, deterministic per-chain address derivation
//! - **Signing Orchestrator**: quorum approval collection and exactly-once
//!   share combination (`pending -> collecting -> signing -> terminal`)
//! - **Cluster Contract**: the seam behind which the actual threshold
//!   cryptography runs, with an in-process implementation for tests
//! - **Webhooks**: HMAC-signed notifications on every terminal transition
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mpc_custody_core::{
//!     CreateWallet, KeyType, MemoryCluster, MemoryNodeStore, MemoryWalletStore,
//!     NodeRegistry, WalletRegistry,
//! };
//!
//! let nodes = Arc::new(MemoryNodeStore::new());
//! let wallets = Arc::new(MemoryWalletStore::new());
//! let cluster = Arc::new(MemoryCluster::new());
//!
//! let registry = WalletRegistry::new(wallets, nodes, cluster);
//! let wallet = registry
//!     .create(CreateWallet {
//!         org_id: "org".into(),
//!         project_id: None,
//!         name: "treasury".into(),
//!         key_type: KeyType::Ecdsa,
//!         threshold: 2,
//!         total_parties: 3,
//!         participant_node_ids: vec!["n1".into(), "n2".into(), "n3".into()],
//!     })
//!     .await?;
//! ```
//!
//! ## Correctness Model
//!
//! The central property is at-most-one combination attempt per signing
//! request: the `collecting -> signing` transition is a compare-and-swap on
//! the stored status, so concurrent approvals reaching quorum together
//! elect exactly one combiner. Terminal request states are immutable.
//!
//! No private key material ever reaches this crate; the orchestrator sees
//! only public commitments, aggregated public keys, and opaque share
//! payloads.

pub mod chain;
pub mod cluster;
pub mod error;
pub mod node;
pub mod notify;
pub mod signing;
pub mod store;
pub mod types;
pub mod wallet;
pub mod webhook;

pub use chain::{derive_address, derive_addresses, keccak256, Chain};
pub use cluster::{
    CombineRequest, CombinedSignature, KeygenOutcome, KeygenSpec, MemoryCluster, MpcCluster,
    SignatureShare,
};
pub use error::{CustodyError, Result};
pub use node::{NodeRegistry, RegisterNode, UpdateNode, DEFAULT_NODE_PORT};
pub use notify::{ApprovalNotifier, LogNotifier};
pub use signing::{
    ApprovalResponse, ChainBroadcaster, CreateSigningRequest, SigningOrchestrator,
};
pub use store::{
    MemoryNodeStore, MemorySigningStore, MemoryWalletStore, NodeStore, RequestPatch, SigningStore,
    WalletStore,
};
pub use types::{
    ApprovalState, Approver, KeyType, Metadata, MpcNode, MpcWallet, NodeStatus, RequestStatus,
    SigningApproval, SigningRequest, WalletStatus,
};
pub use wallet::{CreateWallet, UpdateWallet, WalletAddresses, WalletRegistry};
pub use webhook::{WebhookConfig, WebhookEvent, WebhookPayload, WebhookService};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
