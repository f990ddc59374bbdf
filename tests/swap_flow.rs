//! End-to-end order flows against in-process chains

mod common;

use common::*;
use fusion_coordinator::coordination::{AuctionParams, RevealResponse, SubmitOrder};
use fusion_coordinator::error::CoordinatorError;
use fusion_coordinator::order::{ChainSide, OrderHash, OrderPhase, OrderTerms};
use fusion_coordinator::secret::Secret;

async fn submit(harness: &Harness, terms: OrderTerms, secrets: Vec<Secret>) -> OrderHash {
    harness
        .engine
        .submit_order(SubmitOrder {
            terms,
            signature: None,
            secrets,
            auction: AuctionParams::default(),
        })
        .await
        .unwrap()
        .order_hash
}

/// Claim, fund both stub escrows and confirm them
async fn deploy_both(harness: &Harness, order_hash: &OrderHash, terms: &OrderTerms, dst_balance: u128) {
    harness
        .engine
        .claim(order_hash, RESOLVER, accounts())
        .await
        .unwrap();

    let (src, dst) = escrow_snapshots(terms);
    harness.near.put_escrow(SRC_ESCROW, terms.src_amount, src);
    harness.evm.put_escrow(DST_ESCROW, dst_balance, dst);

    harness
        .engine
        .confirm_escrow_deployed(order_hash, RESOLVER, ChainSide::Src, report(SRC_ESCROW, "src-tx"))
        .await
        .unwrap();
    harness
        .engine
        .confirm_escrow_deployed(order_hash, RESOLVER, ChainSide::Dst, report(DST_ESCROW, "0xd5"))
        .await
        .unwrap();
}

async fn wait_for_phase(harness: &Harness, order_hash: &OrderHash, phase: OrderPhase) -> bool {
    wait_for(|| async {
        harness
            .engine
            .order_status(order_hash)
            .await
            .map(|s| s.order.phase == phase)
            .unwrap_or(false)
    })
    .await
}

async fn wait_until_revealable(harness: &Harness, order_hash: &OrderHash) -> bool {
    wait_for(|| async {
        harness
            .engine
            .order_status(order_hash)
            .await
            .map(|s| {
                s.order.phase == OrderPhase::WaitingForSecret
                    && s.conditions.map(|c| c.all_met()).unwrap_or(false)
            })
            .unwrap_or(false)
    })
    .await
}

#[tokio::test]
async fn test_single_secret_swap_completes() {
    let harness = Harness::new();
    let mut events = harness.engine.events().subscribe();
    let terms = near_to_evm_terms(secret(1).hashlock());
    let order_hash = submit(&harness, terms.clone(), vec![secret(1)]).await;

    deploy_both(&harness, &order_hash, &terms, terms.dst_amount).await;
    harness.clock.advance(120);
    assert!(wait_until_revealable(&harness, &order_hash).await);

    let revealed = harness
        .engine
        .request_reveal(&order_hash, RESOLVER, None)
        .await
        .unwrap();
    assert_eq!(
        revealed,
        RevealResponse::Released {
            index: 0,
            secret: secret(1),
            proof: None,
        }
    );

    let again = harness
        .engine
        .request_reveal(&order_hash, RESOLVER, None)
        .await
        .unwrap();
    assert_eq!(again, RevealResponse::AlreadyRevealed { index: 0 });

    harness.near.set_withdrawn(SRC_ESCROW);
    harness.evm.set_withdrawn(DST_ESCROW);
    assert!(wait_for_phase(&harness, &order_hash, OrderPhase::Completed).await);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    for expected in ["OrderSubmitted", "OrderClaimed", "SecretRevealed", "OrderCompleted"] {
        assert!(names.contains(&expected), "missing {} in {:?}", expected, names);
    }
}

#[tokio::test]
async fn test_repeated_deployment_confirmation_is_idempotent() {
    let harness = Harness::new();
    let terms = near_to_evm_terms(secret(2).hashlock());
    let order_hash = submit(&harness, terms.clone(), vec![secret(2)]).await;
    harness
        .engine
        .claim(&order_hash, RESOLVER, accounts())
        .await
        .unwrap();

    let first = harness
        .engine
        .confirm_escrow_deployed(&order_hash, RESOLVER, ChainSide::Src, report(SRC_ESCROW, "src-tx"))
        .await
        .unwrap();

    harness.clock.advance(30);
    let second = harness
        .engine
        .confirm_escrow_deployed(&order_hash, RESOLVER, ChainSide::Src, report(SRC_ESCROW, "src-tx"))
        .await
        .unwrap();

    assert_eq!(second.phase, OrderPhase::SrcEscrowDeployed);
    assert_eq!(second.version, first.version);
    assert_eq!(
        second.src_escrow.as_ref().map(|e| e.deployed_at),
        first.src_escrow.as_ref().map(|e| e.deployed_at)
    );
}

#[tokio::test]
async fn test_underfunded_destination_blocks_reveal() {
    let harness = Harness::new();
    let terms = near_to_evm_terms(secret(3).hashlock());
    let order_hash = submit(&harness, terms.clone(), vec![secret(3)]).await;

    deploy_both(&harness, &order_hash, &terms, terms.dst_amount - 1).await;
    harness.clock.advance(120);
    assert!(wait_for_phase(&harness, &order_hash, OrderPhase::WaitingForSecret).await);

    let report = harness.engine.verify_order(&order_hash).await.unwrap();
    assert!(report.src.is_verified());
    assert!(!report.dst.is_verified());
    assert!(!report.safe);

    match harness
        .engine
        .request_reveal(&order_hash, RESOLVER, None)
        .await
        .unwrap()
    {
        RevealResponse::NotReady { missing } => {
            assert!(missing.contains(&"escrow_safety_confirmed"))
        }
        other => panic!("secret must not be released: {:?}", other),
    }
}

#[tokio::test]
async fn test_reveal_refused_in_cancellation_window() {
    let harness = Harness::new();
    let terms = near_to_evm_terms(secret(4).hashlock());
    let order_hash = submit(&harness, terms.clone(), vec![secret(4)]).await;

    deploy_both(&harness, &order_hash, &terms, terms.dst_amount).await;
    harness.clock.advance(120);
    assert!(wait_until_revealable(&harness, &order_hash).await);

    // Destination enters resolver cancellation at 1500s
    harness.clock.advance(1_400);
    let err = harness
        .engine
        .request_reveal(&order_hash, RESOLVER, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::WindowNotOpen(_)));
}

#[tokio::test]
async fn test_sequential_partial_fills_complete_order() {
    let harness = Harness::new();
    let secrets: Vec<Secret> = (11..=15).map(secret).collect();
    let mut terms = near_to_evm_terms(merkle_hashlock(&secrets));
    terms.allow_partial_fills = true;
    terms.fill_parts = 4;
    let order_hash = submit(&harness, terms, secrets).await;
    harness
        .engine
        .claim(&order_hash, RESOLVER, accounts())
        .await
        .unwrap();

    let mut cumulative = Vec::new();
    for (amount, index) in [(200_000, 1), (600_000, 4), (200_000, 5)] {
        let fill = harness
            .engine
            .submit_partial_fill(&order_hash, RESOLVER, amount, index)
            .await
            .unwrap();
        assert_eq!(fill.secret_index, index);
        cumulative.push(fill.cumulative);
    }
    assert_eq!(cumulative, vec![200_000, 800_000, 1_000_000]);

    let status = harness.engine.order_status(&order_hash).await.unwrap();
    let state = status.order.partial_fill.unwrap();
    assert!(state.completed);
    assert_eq!(state.consumed, vec![1, 4, 5]);
    assert_eq!(status.available_indices, Some(vec![2, 3]));
}

#[tokio::test]
async fn test_consumed_index_cannot_be_reused() {
    let harness = Harness::new();
    let secrets: Vec<Secret> = (21..=25).map(secret).collect();
    let mut terms = near_to_evm_terms(merkle_hashlock(&secrets));
    terms.allow_partial_fills = true;
    terms.fill_parts = 4;
    let order_hash = submit(&harness, terms, secrets).await;
    harness
        .engine
        .claim(&order_hash, RESOLVER, accounts())
        .await
        .unwrap();

    harness
        .engine
        .submit_partial_fill(&order_hash, RESOLVER, 300_000, 2)
        .await
        .unwrap();

    let err = harness
        .engine
        .submit_partial_fill(&order_hash, RESOLVER, 100_000, 2)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Secret 2 already used or invalid");
}

#[tokio::test]
async fn test_partial_fill_secret_released_with_proof() {
    let harness = Harness::new();
    let secrets: Vec<Secret> = (31..=35).map(secret).collect();
    let mut terms = near_to_evm_terms(merkle_hashlock(&secrets));
    terms.allow_partial_fills = true;
    terms.fill_parts = 4;
    let order_hash = submit(&harness, terms.clone(), secrets.clone()).await;

    deploy_both(&harness, &order_hash, &terms, terms.dst_amount).await;
    harness
        .engine
        .submit_partial_fill(&order_hash, RESOLVER, 250_000, 1)
        .await
        .unwrap();

    harness.clock.advance(120);
    assert!(wait_until_revealable(&harness, &order_hash).await);

    match harness
        .engine
        .request_reveal(&order_hash, RESOLVER, Some(1))
        .await
        .unwrap()
    {
        RevealResponse::Released { index, secret, proof } => {
            assert_eq!(index, 1);
            assert_eq!(secret, secrets[0]);
            let proof = proof.expect("partial-fill secrets carry a proof");
            assert!(proof.verify(&secret.hashlock(), &terms.hashlock));
        }
        other => panic!("expected release, got {:?}", other),
    }

    let err = harness
        .engine
        .request_reveal(&order_hash, RESOLVER, Some(2))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidFill(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_claim_race_has_one_winner() {
    let harness = Harness::new();
    let terms = near_to_evm_terms(secret(5).hashlock());
    let order_hash = submit(&harness, terms, vec![secret(5)]).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = harness.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .claim(&order_hash, &format!("resolver-{}", i), accounts())
                .await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(order) => winners.push(order.resolver),
            Err(CoordinatorError::AlreadyClaimed { .. }) => {}
            Err(other) => panic!("unexpected error {}", other),
        }
    }
    assert_eq!(winners.len(), 1);

    let order = harness.engine.order_status(&order_hash).await.unwrap().order;
    assert_eq!(order.resolver, winners[0]);
}

#[tokio::test]
async fn test_cancelled_escrow_is_recovered() {
    let harness = Harness::new();
    let terms = near_to_evm_terms(secret(6).hashlock());
    let order_hash = submit(&harness, terms.clone(), vec![secret(6)]).await;
    harness
        .engine
        .claim(&order_hash, RESOLVER, accounts())
        .await
        .unwrap();

    let (src, _) = escrow_snapshots(&terms);
    harness.near.put_escrow(SRC_ESCROW, terms.src_amount, src);
    harness
        .engine
        .confirm_escrow_deployed(&order_hash, RESOLVER, ChainSide::Src, report(SRC_ESCROW, "src-tx"))
        .await
        .unwrap();

    // Public cancellation lets the maker cancel
    harness.clock.advance(3_600);
    let order = harness
        .engine
        .cancel(&order_hash, &terms.maker, "resolver went quiet")
        .await
        .unwrap();
    assert_eq!(order.phase, OrderPhase::Recovery);

    harness.near.set_cancelled(SRC_ESCROW);
    assert!(wait_for_phase(&harness, &order_hash, OrderPhase::Cancelled).await);
}

#[tokio::test]
async fn test_order_completes_after_long_unverified_stretch() {
    let harness = Harness::with_max_attempts(3);
    let terms = near_to_evm_terms(secret(7).hashlock());
    let order_hash = submit(&harness, terms.clone(), vec![secret(7)]).await;

    deploy_both(&harness, &order_hash, &terms, terms.dst_amount - 1).await;
    harness.clock.advance(120);
    assert!(wait_for_phase(&harness, &order_hash, OrderPhase::WaitingForSecret).await);

    // Well past three unsafe polls
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(harness.engine.active_watchers(), 1);

    let (_, dst) = escrow_snapshots(&terms);
    harness.evm.put_escrow(DST_ESCROW, terms.dst_amount, dst);
    harness.near.set_withdrawn(SRC_ESCROW);
    harness.evm.set_withdrawn(DST_ESCROW);
    assert!(wait_for_phase(&harness, &order_hash, OrderPhase::Completed).await);
    assert!(wait_for(|| async { harness.engine.active_watchers() == 0 }).await);
}

#[tokio::test]
async fn test_fill_refused_where_secrets_are_not_held() {
    let harness = Harness::new();
    let secrets: Vec<Secret> = (41..=45).map(secret).collect();
    let mut terms = near_to_evm_terms(merkle_hashlock(&secrets));
    terms.allow_partial_fills = true;
    terms.fill_parts = 4;
    let order_hash = submit(&harness, terms, secrets).await;

    let peer = harness.peer();
    peer.claim(&order_hash, RESOLVER, accounts()).await.unwrap();

    let err = peer
        .submit_partial_fill(&order_hash, RESOLVER, 250_000, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Internal(_)));

    let status = harness.engine.order_status(&order_hash).await.unwrap();
    assert_eq!(status.order.partial_fill.unwrap().consumed, Vec::<u32>::new());

    let fill = harness
        .engine
        .submit_partial_fill(&order_hash, RESOLVER, 250_000, 1)
        .await
        .unwrap();
    assert_eq!(fill.secret_index, 1);
}
