//! Chain Verification
//!
//! Walks a partition from genesis to a snapshot of its tip and reports every
//! anomaly it finds rather than stopping at the first one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::block::{ChainBlock, ContentHash};
use crate::audit::event::validate_partition;
use crate::crypto::Verifier;
use crate::error::{LedgerError, LedgerResult};
use crate::store::{ChainStore, StoredBlock};

pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Outcome of a full-chain walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerificationResult {
    pub partition: String,
    pub verified: bool,
    pub total_blocks: u64,
    pub verified_blocks: u64,
    pub blocks_checked: u64,
    pub tip_position: Option<u64>,
    pub broken_chains: Vec<u64>,
    pub invalid_signatures: Vec<u64>,
    pub missing_blocks: Vec<u64>,
    /// False when the walk was cancelled before reaching the tip
    pub complete: bool,
    pub verification_timestamp: DateTime<Utc>,
}

impl ChainVerificationResult {
    fn empty(partition: &str, tip_position: Option<u64>) -> Self {
        Self {
            partition: partition.to_string(),
            verified: false,
            total_blocks: tip_position.map(|p| p + 1).unwrap_or(0),
            verified_blocks: 0,
            blocks_checked: 0,
            tip_position,
            broken_chains: Vec::new(),
            invalid_signatures: Vec::new(),
            missing_blocks: Vec::new(),
            complete: true,
            verification_timestamp: Utc::now(),
        }
    }

    pub fn anomaly_count(&self) -> usize {
        self.broken_chains.len() + self.invalid_signatures.len() + self.missing_blocks.len()
    }
}

/// Proof for a single event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditProof {
    pub event_id: Uuid,
    pub partition: String,
    pub chain_position: u64,
    pub content_hash: String,
    pub previous_hash: String,
    pub signature: String,
    pub signer_key_id: String,
    pub signature_valid: bool,
    /// `None` when the predecessor block is missing or unreadable
    pub predecessor_linked: Option<bool>,
    /// `None` when there is no successor yet, or it is missing or unreadable
    pub successor_linked: Option<bool>,
    pub verified: bool,
    /// Why the stored row could not be decoded, if it could not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreadable: Option<String>,
    pub generated_at: DateTime<Utc>,
}

/// Hash and signature state of one intact block
struct BlockCheck {
    recomputed: ContentHash,
    signature_valid: bool,
}

#[derive(Clone)]
pub struct ChainVerifier {
    store: Arc<dyn ChainStore>,
    verifier: Verifier,
    page_size: usize,
}

impl ChainVerifier {
    pub fn new(store: Arc<dyn ChainStore>, verifier: Verifier) -> Self {
        Self {
            store,
            verifier,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Content hash matches and the signature checks out under the
    /// recorded key.
    fn check(&self, block: &ChainBlock) -> BlockCheck {
        let recomputed = ContentHash::of_event(&block.event);
        let signature_valid = recomputed == block.content_hash
            && self.verifier.verify(
                &block.signing_payload(),
                &block.signature,
                &block.signer_key_id,
            );
        BlockCheck {
            recomputed,
            signature_valid,
        }
    }

    /// Verify the whole partition up to the tip observed at the start.
    ///
    /// Blocks appended during the walk are not examined. Cancelling the
    /// token returns what was found so far with `complete == false`.
    pub async fn verify_chain(
        &self,
        partition: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<ChainVerificationResult> {
        validate_partition(partition)?;

        let tip = self.store.tip(partition).await?;
        let mut result = ChainVerificationResult::empty(partition, tip.map(|t| t.position));
        let Some(tip) = tip else {
            result.verified = true;
            info!("Partition {} is empty", partition);
            return Ok(result);
        };

        // recomputed hash of the block at `expected - 1`, if it was intact
        let mut predecessor: Option<ContentHash> = None;
        let mut expected: u64 = 0;

        'pages: while expected <= tip.position {
            if cancel.is_cancelled() {
                result.complete = false;
                break;
            }

            let page = self
                .store
                .iterate(partition, expected, self.page_size)
                .await?;
            if page.is_empty() {
                result.missing_blocks.extend(expected..=tip.position);
                break;
            }

            for stored in page {
                if cancel.is_cancelled() {
                    result.complete = false;
                    break 'pages;
                }

                let position = stored.chain_position();
                if position > tip.position {
                    break 'pages;
                }
                if position > expected {
                    result.missing_blocks.extend(expected..position);
                    predecessor = None;
                }
                expected = position + 1;
                result.blocks_checked += 1;

                let block = match stored {
                    StoredBlock::Intact(block) => block,
                    StoredBlock::Corrupt(corrupt) => {
                        warn!(
                            "Block {} in {} is unreadable: {}",
                            position, partition, corrupt.reason
                        );
                        result.invalid_signatures.push(position);
                        predecessor = None;
                        continue;
                    }
                };

                let check = self.check(&block);
                let mut clean = true;
                if !check.signature_valid {
                    debug!("Block {} in {} failed its signature check", position, partition);
                    result.invalid_signatures.push(position);
                    clean = false;
                }

                let linked = if position == 0 {
                    Some(block.previous_hash.is_genesis())
                } else {
                    predecessor.map(|prev| block.previous_hash == prev)
                };
                if linked == Some(false) {
                    debug!("Block {} in {} does not link to its predecessor", position, partition);
                    result.broken_chains.push(position);
                    clean = false;
                }

                if clean {
                    result.verified_blocks += 1;
                }
                predecessor = Some(check.recomputed);
            }
        }

        result.verified = result.complete && result.anomaly_count() == 0;
        result.verification_timestamp = Utc::now();

        if result.verified {
            info!(
                "Partition {} verified: {} blocks up to position {}",
                partition, result.total_blocks, tip.position
            );
        } else {
            warn!(
                "Partition {} failed verification: {} broken links, {} invalid signatures, {} missing blocks{}",
                partition,
                result.broken_chains.len(),
                result.invalid_signatures.len(),
                result.missing_blocks.len(),
                if result.complete { "" } else { " (incomplete)" }
            );
        }

        Ok(result)
    }

    /// Check a single event: its own signature and hash plus its links to
    /// the neighbouring blocks.
    ///
    /// A row that no longer decodes yields a failed proof, not an error.
    pub async fn verify_one(&self, partition: &str, event_id: &Uuid) -> LedgerResult<AuditProof> {
        validate_partition(partition)?;

        let stored = self
            .store
            .lookup_event(partition, event_id)
            .await?
            .ok_or_else(|| {
                LedgerError::NotFound(format!("event {} in partition {}", event_id, partition))
            })?;

        let block = match stored {
            StoredBlock::Intact(block) => block,
            StoredBlock::Corrupt(corrupt) => {
                warn!(
                    "Proof requested for unreadable block {} in {}: {}",
                    corrupt.chain_position, partition, corrupt.reason
                );
                return Ok(AuditProof {
                    event_id: *event_id,
                    partition: partition.to_string(),
                    chain_position: corrupt.chain_position,
                    content_hash: corrupt.content_hash,
                    previous_hash: corrupt.previous_hash,
                    signature: corrupt.signature,
                    signer_key_id: corrupt.signer_key_id,
                    signature_valid: false,
                    predecessor_linked: None,
                    successor_linked: None,
                    verified: false,
                    unreadable: Some(corrupt.reason),
                    generated_at: Utc::now(),
                });
            }
        };

        let check = self.check(&block);
        let position = block.chain_position;

        let predecessor_linked = if position == 0 {
            Some(block.previous_hash.is_genesis())
        } else {
            self.neighbour(partition, position - 1)
                .await?
                .map(|prev| block.previous_hash == ContentHash::of_event(&prev.event))
        };

        let successor_linked = self
            .neighbour(partition, position + 1)
            .await?
            .map(|next| next.previous_hash == check.recomputed);

        let verified = check.signature_valid
            && predecessor_linked != Some(false)
            && successor_linked != Some(false);

        Ok(AuditProof {
            event_id: *event_id,
            partition: partition.to_string(),
            chain_position: position,
            content_hash: block.content_hash.to_string(),
            previous_hash: block.previous_hash.to_string(),
            signature: block.signature,
            signer_key_id: block.signer_key_id,
            signature_valid: check.signature_valid,
            predecessor_linked,
            successor_linked,
            verified,
            unreadable: None,
            generated_at: Utc::now(),
        })
    }

    /// Intact block at `position`. Missing and unreadable rows both come
    /// back as `None`, the same way the chain walk drops its predecessor.
    async fn neighbour(&self, partition: &str, position: u64) -> LedgerResult<Option<ChainBlock>> {
        let mut page = self.store.iterate(partition, position, 1).await?;
        match page.pop() {
            Some(StoredBlock::Intact(block)) if block.chain_position == position => Ok(Some(block)),
            _ => Ok(None),
        }
    }
}
