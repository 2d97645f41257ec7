#![allow(dead_code)]

use audit_ledger::audit::codec;
use audit_ledger::audit::event::{Actor, EventType, NewAuditEvent, Outcome, Resource};
use audit_ledger::audit::ledger::{AuditLedger, RetryPolicy};
use audit_ledger::audit::verify::ChainVerifier;
use audit_ledger::audit::AuditEvent;
use audit_ledger::crypto::{KeyManager, Signer, Verifier};
use audit_ledger::database::Database;
use audit_ledger::store::{ChainStore, SqliteChainStore};
use std::sync::Arc;
use std::time::Duration;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    let db = Database::new_in_memory()
        .await
        .expect("Failed to create test database");
    db.run_migrations().await.expect("Failed to run migrations");
    db
}

/// Ledger, verifier and the pieces behind them, sharing one database
pub struct TestLedger {
    pub db: Database,
    pub store: Arc<dyn ChainStore>,
    pub keys: Arc<KeyManager>,
    pub ledger: Arc<AuditLedger>,
    pub verifier: ChainVerifier,
}

pub async fn setup_test_ledger() -> TestLedger {
    let db = setup_test_db().await;
    ledger_on(db, Arc::new(KeyManager::generate()))
}

/// Another writer on the same database, with its own in-process locks
pub fn ledger_on(db: Database, keys: Arc<KeyManager>) -> TestLedger {
    let store: Arc<dyn ChainStore> = Arc::new(SqliteChainStore::new(db.pool().clone()));
    let ledger = AuditLedger::new(store.clone(), Signer::new(keys.clone()), test_retry_policy());
    let verifier = ChainVerifier::new(store.clone(), Verifier::new(keys.clone())).with_page_size(2);
    TestLedger {
        db,
        store,
        keys,
        ledger: Arc::new(ledger),
        verifier,
    }
}

pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 50,
        base_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

/// A plain access-control event
pub fn access_event(user: &str, action: &str) -> NewAuditEvent {
    NewAuditEvent::new(
        EventType::AccessControl,
        Actor {
            user_id: user.to_string(),
            org_id: "acme".to_string(),
        },
        Resource {
            resource_type: "role".to_string(),
            resource_id: "admin".to_string(),
        },
        action,
        Outcome::success().with_detail("ip", "10.0.0.7"),
    )
}

/// Delete a block row directly, leaving the chain head alone
pub async fn delete_block(db: &Database, partition: &str, position: i64) {
    sqlx::query("DELETE FROM chain_blocks WHERE partition = ? AND chain_position = ?")
        .bind(partition)
        .bind(position)
        .execute(db.pool())
        .await
        .expect("Failed to delete block");
}

/// Rewrite the stored event of a block, keeping its hash and signature
pub async fn tamper_event<F>(db: &Database, partition: &str, position: i64, f: F)
where
    F: FnOnce(&mut AuditEvent),
{
    let bytes: Vec<u8> = sqlx::query_scalar(
        "SELECT event_bytes FROM chain_blocks WHERE partition = ? AND chain_position = ?",
    )
    .bind(partition)
    .bind(position)
    .fetch_one(db.pool())
    .await
    .expect("Failed to read block");

    let mut event = codec::decode(&bytes).expect("Stored event should decode");
    f(&mut event);

    sqlx::query("UPDATE chain_blocks SET event_bytes = ? WHERE partition = ? AND chain_position = ?")
        .bind(codec::canonicalize(&event))
        .bind(partition)
        .bind(position)
        .execute(db.pool())
        .await
        .expect("Failed to tamper block");
}

/// Overwrite the stored predecessor hash of a block
pub async fn set_previous_hash(db: &Database, partition: &str, position: i64, hash: &str) {
    sqlx::query("UPDATE chain_blocks SET previous_hash = ? WHERE partition = ? AND chain_position = ?")
        .bind(hash)
        .bind(partition)
        .bind(position)
        .execute(db.pool())
        .await
        .expect("Failed to rewrite previous hash");
}

/// Replace the stored event with bytes that no longer decode
pub async fn corrupt_event_bytes(db: &Database, partition: &str, position: i64) {
    sqlx::query("UPDATE chain_blocks SET event_bytes = X'FF00' WHERE partition = ? AND chain_position = ?")
        .bind(partition)
        .bind(position)
        .execute(db.pool())
        .await
        .expect("Failed to corrupt block");
}
