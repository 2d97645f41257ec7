//! Chain Store
//!
//! Append-only persistence of chain blocks, one ordered chain per partition.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::block::{ChainBlock, ChainTip};
use crate::error::{LedgerError, LedgerResult};

pub use memory::InMemoryChainStore;
pub use sqlite::SqliteChainStore;

/// A stored row whose event no longer decodes.
///
/// The remaining columns are kept as stored, unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptBlock {
    pub chain_position: u64,
    pub reason: String,
    pub content_hash: String,
    pub previous_hash: String,
    pub signature: String,
    pub signer_key_id: String,
}

/// What the store holds at a position
#[derive(Debug, Clone, PartialEq)]
pub enum StoredBlock {
    Intact(ChainBlock),
    Corrupt(CorruptBlock),
}

impl StoredBlock {
    pub fn chain_position(&self) -> u64 {
        match self {
            StoredBlock::Intact(block) => block.chain_position,
            StoredBlock::Corrupt(corrupt) => corrupt.chain_position,
        }
    }
}

/// One partition and its tip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub partition: String,
    pub tip_position: u64,
    pub tip_hash: String,
}

/// Storage backend for chain partitions.
///
/// Implementations must be thread-safe and must make `append` atomic: the
/// block is accepted only if it extends the current tip exactly (next
/// position, matching predecessor hash). Anything else is a
/// `PositionConflict`, and a failed append leaves nothing behind.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Append `block` as the new tip of `partition`.
    ///
    /// # Errors
    ///
    /// `PositionConflict` if the position is taken or does not follow the
    /// tip, `StorageUnavailable` on backend failure.
    async fn append(&self, partition: &str, block: &ChainBlock) -> LedgerResult<()>;

    /// Block at `position`, if present.
    async fn get(&self, partition: &str, position: u64) -> LedgerResult<Option<ChainBlock>>;

    /// Stored row holding `event_id`, if present, whether or not it still
    /// decodes.
    async fn lookup_event(
        &self,
        partition: &str,
        event_id: &Uuid,
    ) -> LedgerResult<Option<StoredBlock>>;

    /// Block holding `event_id`, if present.
    ///
    /// # Errors
    ///
    /// `MalformedEvent` if the stored row no longer decodes.
    async fn get_by_event_id(
        &self,
        partition: &str,
        event_id: &Uuid,
    ) -> LedgerResult<Option<ChainBlock>> {
        match self.lookup_event(partition, event_id).await? {
            Some(StoredBlock::Intact(block)) => Ok(Some(block)),
            Some(StoredBlock::Corrupt(corrupt)) => Err(LedgerError::MalformedEvent(format!(
                "block {}: {}",
                corrupt.chain_position, corrupt.reason
            ))),
            None => Ok(None),
        }
    }

    /// Up to `limit` stored blocks at or after `from_position`, ascending.
    ///
    /// Never returns positions past the tip; callers page by restarting
    /// from the last position seen plus one.
    async fn iterate(
        &self,
        partition: &str,
        from_position: u64,
        limit: usize,
    ) -> LedgerResult<Vec<StoredBlock>>;

    /// Current tip, `None` for an empty partition.
    async fn tip(&self, partition: &str) -> LedgerResult<Option<ChainTip>>;

    /// Current tip position, `None` for an empty partition.
    async fn tip_position(&self, partition: &str) -> LedgerResult<Option<u64>> {
        Ok(self.tip(partition).await?.map(|t| t.position))
    }

    /// Every partition that has at least one block.
    async fn partitions(&self) -> LedgerResult<Vec<PartitionSummary>>;
}
