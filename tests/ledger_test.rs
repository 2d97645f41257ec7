//! End-to-end ledger and verification tests against SQLite

mod common;

use audit_ledger::audit::block::ContentHash;
use audit_ledger::crypto::{KeyManager, KeyProvider};
use audit_ledger::store::ChainStore;
use audit_ledger::LedgerError;
use common::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_sequential_records_form_a_verified_chain() {
    let t = setup_test_ledger().await;

    let mut positions = Vec::new();
    for (user, action) in [("alice", "grant"), ("bob", "revoke"), ("carol", "grant")] {
        let block = t.ledger.record("acme", access_event(user, action)).await.unwrap();
        positions.push(block.chain_position);
    }
    assert_eq!(positions, vec![0, 1, 2]);
    assert_eq!(t.store.tip_position("acme").await.unwrap(), Some(2));

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.verified);
    assert_eq!(result.total_blocks, 3);
    assert_eq!(result.verified_blocks, 3);
    assert!(result.broken_chains.is_empty());
    assert!(result.invalid_signatures.is_empty());
    assert!(result.missing_blocks.is_empty());
}

#[tokio::test]
async fn test_stored_blocks_round_trip() {
    let t = setup_test_ledger().await;
    let recorded = t
        .ledger
        .record("acme", access_event("alice", "grant").with_risk_score(40))
        .await
        .unwrap();

    let stored = t.store.get("acme", 0).await.unwrap().unwrap();
    assert_eq!(stored, recorded);
    assert!(stored.verify_content_hash());
    assert_eq!(stored.event.risk_score, Some(40));
}

#[tokio::test]
async fn test_deleted_block_is_missing() {
    let t = setup_test_ledger().await;
    for i in 0..3 {
        t.ledger
            .record("acme", access_event("alice", &format!("op-{}", i)))
            .await
            .unwrap();
    }
    delete_block(&t.db, "acme", 1).await;

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!result.verified);
    assert_eq!(result.missing_blocks, vec![1]);
}

#[tokio::test]
async fn test_deleted_tip_is_missing() {
    let t = setup_test_ledger().await;
    for i in 0..3 {
        t.ledger
            .record("acme", access_event("alice", &format!("op-{}", i)))
            .await
            .unwrap();
    }
    delete_block(&t.db, "acme", 2).await;

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.missing_blocks, vec![2]);
    assert_eq!(result.tip_position, Some(2));
}

#[tokio::test]
async fn test_tampered_event_is_reported_at_its_position() {
    let t = setup_test_ledger().await;
    for i in 0..5 {
        t.ledger
            .record("acme", access_event("alice", &format!("op-{}", i)))
            .await
            .unwrap();
    }
    tamper_event(&t.db, "acme", 2, |event| event.actor.user_id = "mallory".to_string()).await;

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert!(!result.verified);
    assert!(result.invalid_signatures.contains(&2));
    assert!(result.invalid_signatures.iter().all(|p| *p >= 2));
    assert!(result.broken_chains.iter().all(|p| *p >= 2));
    assert!(result.missing_blocks.is_empty());
}

#[tokio::test]
async fn test_rewritten_previous_hash_breaks_chain() {
    let t = setup_test_ledger().await;
    for i in 0..4 {
        t.ledger
            .record("acme", access_event("alice", &format!("op-{}", i)))
            .await
            .unwrap();
    }
    let bogus = ContentHash::digest(b"forged parent").to_string();
    set_previous_hash(&t.db, "acme", 2, &bogus).await;

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.broken_chains, vec![2]);
}

#[tokio::test]
async fn test_unreadable_row_is_reported_not_fatal() {
    let t = setup_test_ledger().await;
    for i in 0..3 {
        t.ledger
            .record("acme", access_event("alice", &format!("op-{}", i)))
            .await
            .unwrap();
    }
    corrupt_event_bytes(&t.db, "acme", 1).await;

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.invalid_signatures, vec![1]);
    assert_eq!(result.blocks_checked, 3);
    assert!(result.missing_blocks.is_empty());
}

#[tokio::test]
async fn test_proof_for_unreadable_row_fails_without_error() {
    let t = setup_test_ledger().await;
    let mut blocks = Vec::new();
    for i in 0..3 {
        blocks.push(
            t.ledger
                .record("acme", access_event("alice", &format!("op-{}", i)))
                .await
                .unwrap(),
        );
    }
    corrupt_event_bytes(&t.db, "acme", 1).await;

    let proof = t
        .verifier
        .verify_one("acme", &blocks[1].event.event_id)
        .await
        .unwrap();
    assert!(!proof.signature_valid);
    assert!(!proof.verified);
    assert_eq!(proof.chain_position, 1);
    assert_eq!(proof.content_hash, blocks[1].content_hash.to_string());
    assert_eq!(proof.signer_key_id, blocks[1].signer_key_id);
    assert!(proof.unreadable.is_some());

    // neighbours of the unreadable row skip that link, as the chain walk does
    for neighbour in [&blocks[0], &blocks[2]] {
        let proof = t
            .verifier
            .verify_one("acme", &neighbour.event.event_id)
            .await
            .unwrap();
        assert!(proof.signature_valid);
        assert!(proof.verified, "{:?}", proof);
    }
    let after = t
        .verifier
        .verify_one("acme", &blocks[2].event.event_id)
        .await
        .unwrap();
    assert_eq!(after.predecessor_linked, None);
    let before = t
        .verifier
        .verify_one("acme", &blocks[0].event.event_id)
        .await
        .unwrap();
    assert_eq!(before.successor_linked, None);

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.invalid_signatures, vec![1]);
    assert!(result.broken_chains.is_empty());
}

#[tokio::test]
async fn test_verification_is_idempotent() {
    let t = setup_test_ledger().await;
    for i in 0..4 {
        t.ledger
            .record("acme", access_event("alice", &format!("op-{}", i)))
            .await
            .unwrap();
    }
    delete_block(&t.db, "acme", 0).await;
    tamper_event(&t.db, "acme", 3, |event| event.action = "erase".to_string()).await;

    let cancel = CancellationToken::new();
    let first = t.verifier.verify_chain("acme", &cancel).await.unwrap();
    let second = t.verifier.verify_chain("acme", &cancel).await.unwrap();
    assert_eq!(first.missing_blocks, second.missing_blocks);
    assert_eq!(first.invalid_signatures, second.invalid_signatures);
    assert_eq!(first.broken_chains, second.broken_chains);
    assert_eq!(first.verified_blocks, second.verified_blocks);
}

#[tokio::test]
async fn test_concurrent_writers_share_one_chain() {
    let db = setup_test_db().await;
    let keys = Arc::new(KeyManager::generate());
    // two ledgers stand in for two processes: only the store arbitrates
    let writers = [ledger_on(db.clone(), keys.clone()), ledger_on(db.clone(), keys.clone())];

    let mut handles = Vec::new();
    for (w, writer) in writers.iter().enumerate() {
        for i in 0..8 {
            let ledger = writer.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .record("acme", access_event(&format!("w{}", w), &format!("op-{}", i)))
                    .await
                    .map(|block| block.chain_position)
            }));
        }
    }

    let mut positions = BTreeSet::new();
    for handle in handles {
        assert!(positions.insert(handle.await.unwrap().unwrap()));
    }
    assert_eq!(positions, (0..16).collect::<BTreeSet<u64>>());

    let result = writers[0]
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.verified);
}

#[tokio::test]
async fn test_rotation_keeps_history_verifiable() {
    let t = setup_test_ledger().await;
    let before = t.ledger.record("acme", access_event("alice", "grant")).await.unwrap();
    t.keys.rotate();
    let after = t.ledger.record("acme", access_event("bob", "grant")).await.unwrap();

    assert_ne!(before.signer_key_id, after.signer_key_id);
    assert_eq!(t.keys.current_key_id().unwrap(), after.signer_key_id);

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.verified);
}

#[tokio::test]
async fn test_external_rotation_reaches_running_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keyring.json");
    let keys = Arc::new(KeyManager::load_or_create(&path, true).unwrap());
    let t = ledger_on(setup_test_db().await, keys.clone());

    let before = t.ledger.record("acme", access_event("alice", "grant")).await.unwrap();

    // the key manager CLI works on the file, not on the running keyring
    let operator = KeyManager::load(&path).unwrap();
    let rotated = operator.rotate();
    operator.save(&path).unwrap();
    keys.reload(&path).unwrap();

    let after = t.ledger.record("acme", access_event("bob", "grant")).await.unwrap();
    assert_eq!(after.signer_key_id, rotated.key_id);
    assert_ne!(before.signer_key_id, after.signer_key_id);

    let result = t
        .verifier
        .verify_chain("acme", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.verified);

    let operator = KeyManager::load(&path).unwrap();
    operator.revoke(&rotated.key_id, "leaked").unwrap();
    operator.save(&path).unwrap();
    keys.reload(&path).unwrap();

    assert!(matches!(
        t.ledger.record("acme", access_event("carol", "grant")).await,
        Err(LedgerError::SigningKeyUnavailable(_))
    ));
    assert_eq!(t.store.tip_position("acme").await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_partitions_do_not_interact() {
    let t = setup_test_ledger().await;
    let a = t.ledger.record("acme", access_event("alice", "grant")).await.unwrap();
    let b = t.ledger.record("globex", access_event("hank", "grant")).await.unwrap();
    assert_eq!(a.chain_position, 0);
    assert_eq!(b.chain_position, 0);
    assert!(b.previous_hash.is_genesis());

    delete_block(&t.db, "acme", 0).await;
    let result = t
        .verifier
        .verify_chain("globex", &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.verified);
}

#[tokio::test]
async fn test_proof_for_single_event() {
    let t = setup_test_ledger().await;
    let mut blocks = Vec::new();
    for i in 0..3 {
        blocks.push(
            t.ledger
                .record("acme", access_event("alice", &format!("op-{}", i)))
                .await
                .unwrap(),
        );
    }

    let proof = t
        .verifier
        .verify_one("acme", &blocks[1].event.event_id)
        .await
        .unwrap();
    assert!(proof.verified);
    assert_eq!(proof.chain_position, 1);
    assert_eq!(proof.content_hash, blocks[1].content_hash.to_string());
    assert_eq!(proof.previous_hash, blocks[0].content_hash.to_string());

    delete_block(&t.db, "acme", 0).await;
    let proof = t
        .verifier
        .verify_one("acme", &blocks[1].event.event_id)
        .await
        .unwrap();
    assert_eq!(proof.predecessor_linked, None);
    assert!(proof.verified);

    assert!(matches!(
        t.verifier.verify_one("globex", &blocks[1].event.event_id).await,
        Err(LedgerError::NotFound(_))
    ));
}
