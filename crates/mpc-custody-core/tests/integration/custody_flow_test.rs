//! Integration tests for the node and wallet registries
//!
//! Covers the path from node registration through wallet activation:
//! health promotion, participant eligibility, DKG, address derivation, and
//! the reference rules between nodes and wallets.

use chrono::Utc;
use mpc_custody_core::{
    Chain, CreateWallet, CustodyError, KeyType, MemoryCluster, MemoryNodeStore, MemoryWalletStore,
    NodeRegistry, NodeStatus, RegisterNode, UpdateWallet, WalletRegistry, WalletStatus,
};
use std::collections::HashMap;
use std::sync::Arc;

struct Stack {
    nodes: NodeRegistry,
    wallets: WalletRegistry,
    cluster: Arc<MemoryCluster>,
}

fn stack() -> Stack {
    let node_store = Arc::new(MemoryNodeStore::new());
    let wallet_store = Arc::new(MemoryWalletStore::new());
    let cluster = Arc::new(MemoryCluster::new());

    Stack {
        nodes: NodeRegistry::new(node_store.clone(), wallet_store.clone()),
        wallets: WalletRegistry::new(wallet_store, node_store, cluster.clone()),
        cluster,
    }
}

async fn register_online(stack: &Stack, org: &str, node_id: &str) -> String {
    let node = stack
        .nodes
        .register(RegisterNode {
            org_id: org.to_string(),
            name: format!("node {node_id}"),
            node_id: node_id.to_string(),
            public_key: None,
            endpoint: Some(format!("{node_id}.cluster.internal")),
            port: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap();
    stack
        .nodes
        .record_health(&node.id, NodeStatus::Online, Utc::now())
        .await
        .unwrap();
    node.id
}

fn two_of_three(org: &str) -> CreateWallet {
    CreateWallet {
        org_id: org.to_string(),
        project_id: None,
        name: "treasury".into(),
        key_type: KeyType::Ecdsa,
        threshold: 2,
        total_parties: 3,
        participant_node_ids: vec!["n1".into(), "n2".into(), "n3".into()],
    }
}

/// Wallet created with t=2, n=3 and three online nodes becomes active with
/// an Ethereum address
#[tokio::test]
async fn wallet_activation_with_online_cluster() {
    let stack = stack();
    for node_id in ["n1", "n2", "n3"] {
        register_online(&stack, "org1", node_id).await;
    }

    let wallet = stack.wallets.create(two_of_three("org1")).await.unwrap();

    assert_eq!(wallet.status, WalletStatus::Active);
    assert_eq!(wallet.threshold, 2);
    assert_eq!(wallet.total_parties, 3);

    let addresses = stack
        .wallets
        .get_addresses("org1", &wallet.id)
        .await
        .unwrap();
    let eth = &addresses.chain_addresses[&Chain::Ethereum];
    assert!(eth.starts_with("0x"));
    assert_eq!(eth.len(), 42);
}

/// Node deletion is refused while an active wallet references it
#[tokio::test]
async fn node_deletion_refused_while_referenced() {
    let stack = stack();
    let mut node_ids = Vec::new();
    for node_id in ["n1", "n2", "n3"] {
        node_ids.push(register_online(&stack, "org1", node_id).await);
    }
    let wallet = stack.wallets.create(two_of_three("org1")).await.unwrap();

    let err = stack.nodes.delete("org1", &node_ids[0]).await.unwrap_err();
    match err {
        CustodyError::Conflict(msg) => assert!(msg.contains(&wallet.wallet_id)),
        other => panic!("expected Conflict, got {other:?}"),
    }

    // Archiving the wallet releases the reference
    stack.wallets.delete("org1", &wallet.id).await.unwrap();
    stack.nodes.delete("org1", &node_ids[0]).await.unwrap();
}

/// Offline or foreign nodes make wallet creation fail with every missing
/// participant named
#[tokio::test]
async fn wallet_creation_names_ineligible_participants() {
    let stack = stack();
    register_online(&stack, "org1", "n1").await;

    // n2 exists but is offline; n3 belongs to a different organization
    stack
        .nodes
        .register(RegisterNode {
            org_id: "org1".into(),
            name: "node n2".into(),
            node_id: "n2".into(),
            public_key: None,
            endpoint: None,
            port: None,
            metadata: HashMap::new(),
        })
        .await
        .unwrap();
    register_online(&stack, "org2", "n3").await;

    let err = stack.wallets.create(two_of_three("org1")).await.unwrap_err();
    match err {
        CustodyError::PreconditionFailed(msg) => {
            assert!(msg.contains("n2"));
            assert!(msg.contains("n3"));
        }
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }
}

/// A failed DKG run leaves the wallet pending with no key material; a retry
/// after the cluster recovers activates it
#[tokio::test]
async fn failed_keygen_is_retryable() {
    let stack = stack();
    for node_id in ["n1", "n2", "n3"] {
        register_online(&stack, "org1", node_id).await;
    }

    stack.cluster.set_fail_keygen(true);
    stack.wallets.create(two_of_three("org1")).await.unwrap_err();

    let pending = &stack.wallets.list("org1", None).await.unwrap()[0];
    assert_eq!(pending.status, WalletStatus::Pending);
    assert!(pending.public_key.is_none());
    assert!(pending.chain_addresses.is_empty());

    stack.cluster.set_fail_keygen(false);
    let wallet = stack
        .wallets
        .retry_keygen("org1", &pending.id)
        .await
        .unwrap();
    assert_eq!(wallet.status, WalletStatus::Active);
    assert!(wallet.public_key.is_some());
}

/// Wallet listing respects organization and project scope
#[tokio::test]
async fn wallet_listing_scopes() {
    let stack = stack();
    for node_id in ["n1", "n2", "n3"] {
        register_online(&stack, "org1", node_id).await;
    }

    let wallet = stack.wallets.create(two_of_three("org1")).await.unwrap();
    stack
        .wallets
        .update(
            "org1",
            &wallet.id,
            UpdateWallet {
                name: None,
                project_id: Some("proj1".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(stack.wallets.list("org1", None).await.unwrap().len(), 1);
    assert_eq!(
        stack
            .wallets
            .list("org1", Some("proj1"))
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(stack
        .wallets
        .list("org1", Some("proj2"))
        .await
        .unwrap()
        .is_empty());
    assert!(stack.wallets.list("org2", None).await.unwrap().is_empty());
}

/// Solana wallets derive base58 addresses from EdDSA keys
#[tokio::test]
async fn eddsa_wallet_derives_solana_address() {
    let stack = stack();
    for node_id in ["n1", "n2", "n3"] {
        register_online(&stack, "org1", node_id).await;
    }

    let mut params = two_of_three("org1");
    params.key_type = KeyType::Eddsa;
    let wallet = stack.wallets.create(params).await.unwrap();

    assert_eq!(wallet.chain_addresses.len(), 1);
    let address = &wallet.chain_addresses[&Chain::Solana];
    assert_eq!(bs58::decode(address).into_vec().unwrap().len(), 32);
}
