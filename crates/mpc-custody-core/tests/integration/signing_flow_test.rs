//! Integration tests for the signing request lifecycle
//!
//! Exercises the full path: wallet activation, request creation, approval
//! collection, exactly-once combination, broadcast, cancellation, and the
//! expiration sweep.

use chrono::{Duration, Utc};
use mpc_custody_core::{
    ApprovalResponse, ApprovalState, Approver, Chain, ChainBroadcaster, CreateSigningRequest,
    CreateWallet, CustodyError, KeyType, LogNotifier, MemoryCluster, MemoryNodeStore,
    MemorySigningStore, MemoryWalletStore, MpcWallet, NodeRegistry, NodeStatus, RegisterNode,
    MpcCluster, RequestStatus, Result, SigningOrchestrator, WalletRegistry, WebhookService,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Broadcaster that derives a deterministic hash from the payload
struct HashBroadcaster;

#[async_trait::async_trait]
impl ChainBroadcaster for HashBroadcaster {
    async fn broadcast(
        &self,
        _chain: Chain,
        raw_transaction: &str,
        _signature: &str,
    ) -> Result<String> {
        let digest = mpc_custody_core::keccak256(&hex::decode(raw_transaction).unwrap());
        Ok(format!("0x{}", hex::encode(digest)))
    }
}

struct Stack {
    orchestrator: Arc<SigningOrchestrator>,
    cluster: Arc<MemoryCluster>,
    wallet: MpcWallet,
}

async fn active_stack() -> Stack {
    let node_store = Arc::new(MemoryNodeStore::new());
    let wallet_store = Arc::new(MemoryWalletStore::new());
    let cluster = Arc::new(MemoryCluster::new());

    let nodes = NodeRegistry::new(node_store.clone(), wallet_store.clone());
    for node_id in ["n1", "n2", "n3"] {
        let node = nodes
            .register(RegisterNode {
                org_id: "org1".into(),
                name: node_id.to_string(),
                node_id: node_id.to_string(),
                public_key: None,
                endpoint: None,
                port: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();
        nodes
            .record_health(&node.id, NodeStatus::Online, Utc::now())
            .await
            .unwrap();
    }

    let wallets = WalletRegistry::new(wallet_store.clone(), node_store, cluster.clone());
    let wallet = wallets
        .create(CreateWallet {
            org_id: "org1".into(),
            project_id: None,
            name: "treasury".into(),
            key_type: KeyType::Ecdsa,
            threshold: 2,
            total_parties: 3,
            participant_node_ids: vec!["n1".into(), "n2".into(), "n3".into()],
        })
        .await
        .unwrap();

    let orchestrator = SigningOrchestrator::new(
        Arc::new(MemorySigningStore::new()),
        wallet_store,
        cluster.clone(),
        Arc::new(LogNotifier),
        Arc::new(WebhookService::new()),
    )
    .with_broadcaster(Arc::new(HashBroadcaster));

    Stack {
        orchestrator: Arc::new(orchestrator),
        cluster,
        wallet,
    }
}

fn request_params(stack: &Stack, required: u16, ttl: Duration) -> CreateSigningRequest {
    CreateSigningRequest {
        org_id: "org1".into(),
        wallet_id: stack.wallet.id.clone(),
        initiator_user_id: Some("u1".into()),
        chain: Chain::Ethereum,
        raw_transaction: hex::encode(b"transfer 1 eth to 0xabc"),
        transaction_details: None,
        approvers: vec![
            Approver::Node("n1".into()),
            Approver::Node("n2".into()),
            Approver::Node("n3".into()),
        ],
        required_approvals: required,
        ttl,
    }
}

async fn share(stack: &Stack, node: &str, raw_transaction: &str) -> String {
    stack
        .cluster
        .produce_share(
            &stack.wallet.wallet_id,
            node,
            &hex::decode(raw_transaction).unwrap(),
        )
        .await
        .unwrap()
        .payload
}

/// Approve, reject, approve on a request requiring 2 approvals: the
/// rejection is recorded, the second approval triggers combination, and the
/// request completes with a broadcast hash
#[tokio::test]
async fn signing_flow_with_mixed_decisions() {
    let stack = active_stack().await;
    let request = stack
        .orchestrator
        .create(request_params(&stack, 2, Duration::minutes(10)))
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Collecting);
    let raw = request.raw_transaction.clone();

    stack
        .orchestrator
        .submit_approval(
            "org1",
            &request.id,
            &Approver::Node("n1".into()),
            ApprovalResponse::Approve {
                signature_share: Some(share(&stack, "n1", &raw).await),
                comment: None,
            },
        )
        .await
        .unwrap();

    stack
        .orchestrator
        .submit_approval(
            "org1",
            &request.id,
            &Approver::Node("n2".into()),
            ApprovalResponse::Reject {
                comment: Some("destination not whitelisted".into()),
            },
        )
        .await
        .unwrap();

    let done = stack
        .orchestrator
        .submit_approval(
            "org1",
            &request.id,
            &Approver::Node("n3".into()),
            ApprovalResponse::Approve {
                signature_share: Some(share(&stack, "n3", &raw).await),
                comment: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(done.status, RequestStatus::Completed);
    assert!(done.combined_signature.is_some());
    assert!(done.tx_hash.as_deref().unwrap().starts_with("0x"));
    assert_eq!(stack.cluster.combine_attempts(), 1);

    let approvals = stack
        .orchestrator
        .approvals("org1", &request.id)
        .await
        .unwrap();
    assert_eq!(
        approvals
            .iter()
            .filter(|a| a.state == ApprovalState::Approved)
            .count(),
        2
    );
    assert_eq!(
        approvals
            .iter()
            .filter(|a| a.state == ApprovalState::Rejected)
            .count(),
        1
    );
}

/// Concurrent approvals reaching quorum together produce exactly one
/// transition to signing and exactly one combination attempt
#[tokio::test]
async fn concurrent_quorum_single_combination() {
    for _ in 0..10 {
        // Repeat to catch interleavings
        let stack = active_stack().await;
        let request = stack
            .orchestrator
            .create(request_params(&stack, 2, Duration::minutes(10)))
            .await
            .unwrap();
        let raw = request.raw_transaction.clone();

        let mut handles = Vec::new();
        for node in ["n1", "n2", "n3"] {
            let orchestrator = Arc::clone(&stack.orchestrator);
            let request_id = request.id.clone();
            let payload = share(&stack, node, &raw).await;
            let approver = Approver::Node(node.into());
            handles.push(tokio::spawn(async move {
                orchestrator
                    .submit_approval(
                        "org1",
                        &request_id,
                        &approver,
                        ApprovalResponse::Approve {
                            signature_share: Some(payload),
                            comment: None,
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            // A submission may observe a request that already left
            // `collecting`; that is the loser's view, not an error
            match handle.await.unwrap() {
                Ok(_) => {}
                Err(CustodyError::PreconditionFailed(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        let done = stack.orchestrator.get("org1", &request.id).await.unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(stack.cluster.combine_attempts(), 1);
    }
}

/// Requests created with ttl = 0 are immediately eligible for the sweep
#[tokio::test]
async fn zero_ttl_swept_to_failed() {
    let stack = active_stack().await;
    let request = stack
        .orchestrator
        .create(request_params(&stack, 2, Duration::zero()))
        .await
        .unwrap();

    assert_eq!(stack.orchestrator.sweep_expired().await.unwrap(), 1);

    let failed = stack.orchestrator.get("org1", &request.id).await.unwrap();
    assert_eq!(failed.status, RequestStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("expired"));
    assert!(failed.completed_at.is_some());

    // Terminal states are immutable: the sweep never touches it again and
    // cancellation is refused
    assert_eq!(stack.orchestrator.sweep_expired().await.unwrap(), 0);
    let err = stack
        .orchestrator
        .cancel("org1", &request.id, "user:u1")
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::PreconditionFailed(_)));
}

/// Completed requests are immutable and queryable with their outcome
#[tokio::test]
async fn listing_filters_by_status() {
    let stack = active_stack().await;
    let completed = stack
        .orchestrator
        .create(request_params(&stack, 2, Duration::minutes(10)))
        .await
        .unwrap();
    let raw = completed.raw_transaction.clone();
    for node in ["n1", "n2"] {
        stack
            .orchestrator
            .submit_approval(
                "org1",
                &completed.id,
                &Approver::Node(node.into()),
                ApprovalResponse::Approve {
                    signature_share: Some(share(&stack, node, &raw).await),
                    comment: None,
                },
            )
            .await
            .unwrap();
    }

    let cancelled = stack
        .orchestrator
        .create(request_params(&stack, 2, Duration::minutes(10)))
        .await
        .unwrap();
    stack
        .orchestrator
        .cancel("org1", &cancelled.id, "user:u1")
        .await
        .unwrap();

    let done = stack
        .orchestrator
        .list("org1", None, Some(RequestStatus::Completed))
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, completed.id);

    let by_wallet = stack
        .orchestrator
        .list("org1", Some(&stack.wallet.id), None)
        .await
        .unwrap();
    assert_eq!(by_wallet.len(), 2);

    assert!(stack
        .orchestrator
        .list("org2", None, None)
        .await
        .unwrap()
        .is_empty());
}
