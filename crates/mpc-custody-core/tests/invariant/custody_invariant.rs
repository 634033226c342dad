//! Invariant tests for the custody subsystem
//!
//! These verify guarantees that must always hold:
//! - `1 <= t < n` for every wallet that gets persisted
//! - address derivation is a pure function of the public key
//! - terminal request states are never left

use chrono::Utc;
use mpc_custody_core::{
    derive_address, derive_addresses, keccak256, Chain, CreateWallet, CustodyError, KeyType,
    MemoryCluster, MemoryNodeStore, MemoryWalletStore, MpcNode, NodeStatus, NodeStore,
    RequestStatus, WalletRegistry, WalletStatus,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn registry_with_nodes(count: usize) -> WalletRegistry {
    let node_store = Arc::new(MemoryNodeStore::new());
    let now = Utc::now();
    for i in 0..count {
        node_store
            .insert(MpcNode {
                id: format!("row-{i}"),
                org_id: "org1".into(),
                name: format!("n{i}"),
                node_id: format!("n{i}"),
                public_key: None,
                endpoint: None,
                port: 8080,
                status: NodeStatus::Online,
                metadata: HashMap::new(),
                last_seen_at: Some(now),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
    }
    WalletRegistry::new(
        Arc::new(MemoryWalletStore::new()),
        node_store,
        Arc::new(MemoryCluster::new()),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// INVARIANT: a wallet is persisted iff 1 <= t < n
    #[test]
    fn threshold_bounds_enforced(threshold in 0u16..8, total in 1u16..8) {
        let rt = runtime();
        let result = rt.block_on(async {
            let registry = registry_with_nodes(total as usize).await;
            registry
                .create(CreateWallet {
                    org_id: "org1".into(),
                    project_id: None,
                    name: "w".into(),
                    key_type: KeyType::Ecdsa,
                    threshold,
                    total_parties: total,
                    participant_node_ids: (0..total).map(|i| format!("n{i}")).collect(),
                })
                .await
        });

        if threshold >= 1 && threshold < total {
            let wallet = result.unwrap();
            prop_assert_eq!(wallet.status, WalletStatus::Active);
            prop_assert!(wallet.threshold >= 1 && wallet.threshold < wallet.total_parties);
        } else {
            prop_assert!(matches!(result.unwrap_err(), CustodyError::Invalid(_)));
        }
    }

    /// INVARIANT: keccak256 is deterministic and always 32 bytes
    #[test]
    fn keccak_deterministic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let a = keccak256(&data);
        let b = keccak256(&data);
        prop_assert_eq!(a, b);
        prop_assert_eq!(a.len(), 32);
    }

    /// INVARIANT: solana derivation round-trips through base58 for any
    /// 32-byte key
    #[test]
    fn solana_address_round_trips(key in prop::array::uniform32(any::<u8>())) {
        let address = derive_address(Chain::Solana, KeyType::Eddsa, &key).unwrap();
        prop_assert_eq!(bs58::decode(&address).into_vec().unwrap(), key.to_vec());
    }

    /// INVARIANT: derivation rejects every chain a key type cannot serve
    #[test]
    fn derivation_respects_key_type(key in prop::array::uniform32(any::<u8>())) {
        prop_assert!(derive_address(Chain::Ethereum, KeyType::Eddsa, &key).is_err());
        prop_assert!(derive_address(Chain::Solana, KeyType::Taproot, &key).is_err());
        prop_assert!(derive_address(Chain::Bitcoin, KeyType::Ecdsa, &key).is_err());
    }
}

/// INVARIANT: the derived address map is a pure function of the key
#[test]
fn address_derivation_is_deterministic() {
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
    let compressed = key.verifying_key().to_encoded_point(true);

    let first = derive_addresses(KeyType::Ecdsa, compressed.as_bytes()).unwrap();
    let second = derive_addresses(KeyType::Ecdsa, compressed.as_bytes()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), Chain::EVM.len());
}

/// INVARIANT: terminal request states are closed under the transition
/// helpers
#[test]
fn terminal_states_are_closed() {
    for status in [
        RequestStatus::Completed,
        RequestStatus::Failed,
        RequestStatus::Cancelled,
    ] {
        assert!(status.is_terminal());
        assert!(!status.is_collectable());
    }
    for status in [RequestStatus::Pending, RequestStatus::Collecting] {
        assert!(!status.is_terminal());
        assert!(status.is_collectable());
    }
}
