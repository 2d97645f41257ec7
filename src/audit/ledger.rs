//! Audit Ledger
//!
//! Turns submitted events into signed, hash-linked blocks and commits them
//! to the chain store. The store's conditional append is the correctness
//! mechanism; the in-process partition locks only keep local writers from
//! fighting over the same tip.

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::block::{signing_payload, ChainBlock, ChainTip, ContentHash};
use crate::audit::codec;
use crate::audit::event::{validate_partition, NewAuditEvent};
use crate::config::LedgerConfig;
use crate::crypto::Signer;
use crate::error::{LedgerError, LedgerResult};
use crate::store::ChainStore;

/// Bounded retry with exponential backoff for position conflicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_backoff);
        let jitter_ms = self.base_backoff.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        capped + jitter
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl From<&LedgerConfig> for RetryPolicy {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            max_attempts: config.max_append_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// One async mutex per partition; different partitions never contend
#[derive(Default)]
struct PartitionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PartitionLocks {
    fn get(&self, partition: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // drop locks nobody is holding or waiting on
        if locks.len() > 1024 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(partition.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Ingestion side of the audit trail
pub struct AuditLedger {
    store: Arc<dyn ChainStore>,
    signer: Signer,
    retry: RetryPolicy,
    locks: PartitionLocks,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn ChainStore>, signer: Signer, retry: RetryPolicy) -> Self {
        Self {
            store,
            signer,
            retry,
            locks: PartitionLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChainStore> {
        &self.store
    }

    /// Validate, hash, link, sign and commit one event.
    ///
    /// Either the returned block is durably stored at its position, or
    /// nothing was written.
    pub async fn record(&self, partition: &str, request: NewAuditEvent) -> LedgerResult<ChainBlock> {
        validate_partition(partition)?;
        request.validate()?;

        if let Some(original) = request.correction_of {
            if self.store.lookup_event(partition, &original).await?.is_none() {
                return Err(LedgerError::InvalidEvent(format!(
                    "correction_of references unknown event {} in partition {}",
                    original, partition
                )));
            }
        }

        let event = request.into_event(Uuid::new_v4(), Utc::now())?;
        let content_hash = ContentHash::digest(&codec::canonicalize(&event));

        let lock = self.locks.get(partition);
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let tip = self.store.tip(partition).await?;
            let (chain_position, previous_hash) = ChainTip::next(tip);
            let (signature, signer_key_id) = self.signer.sign(&signing_payload(
                &content_hash,
                &previous_hash,
                chain_position,
            ))?;

            let block = ChainBlock {
                event: event.clone(),
                content_hash,
                previous_hash,
                chain_position,
                signature,
                signer_key_id,
            };

            match self.store.append(partition, &block).await {
                Ok(()) => {
                    info!(
                        "Recorded {} in {} at position {}",
                        block.event.summary(),
                        partition,
                        block.chain_position
                    );
                    return Ok(block);
                }
                Err(LedgerError::PositionConflict { position, .. })
                    if attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "Position {} in {} was taken (attempt {}/{}), retrying in {:?}",
                        position, partition, attempt, self.retry.max_attempts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(LedgerError::PositionConflict { .. }) => {
                    warn!(
                        "Giving up on {} after {} conflicting attempts",
                        partition, attempt
                    );
                    return Err(LedgerError::ConcurrentWriteConflict {
                        partition: partition.to_string(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    debug!("Append to {} failed: {}", partition, e);
                    return Err(e);
                }
            }
        }
    }
}
