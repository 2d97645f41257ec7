use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{ChainStore, PartitionSummary, StoredBlock};
use crate::audit::block::{ChainBlock, ChainTip};
use crate::error::{LedgerError, LedgerResult};

#[derive(Default)]
struct PartitionChain {
    blocks: BTreeMap<u64, ChainBlock>,
    by_event: HashMap<Uuid, u64>,
    tip: Option<ChainTip>,
}

/// Chain store kept entirely in memory
#[derive(Default)]
pub struct InMemoryChainStore {
    partitions: RwLock<HashMap<String, PartitionChain>>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a stored block without touching the tip, as an out-of-band
    /// deletion would.
    #[cfg(test)]
    pub(crate) async fn remove_block(&self, partition: &str, position: u64) {
        let mut partitions = self.partitions.write().await;
        if let Some(chain) = partitions.get_mut(partition) {
            if let Some(block) = chain.blocks.remove(&position) {
                chain.by_event.remove(&block.event.event_id);
            }
        }
    }

    /// Rewrite a stored block in place, bypassing every append check.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, partition: &str, position: u64, f: F)
    where
        F: FnOnce(&mut ChainBlock),
    {
        let mut partitions = self.partitions.write().await;
        if let Some(block) = partitions
            .get_mut(partition)
            .and_then(|chain| chain.blocks.get_mut(&position))
        {
            f(block);
        }
    }
}

#[async_trait]
impl ChainStore for InMemoryChainStore {
    async fn append(&self, partition: &str, block: &ChainBlock) -> LedgerResult<()> {
        let mut partitions = self.partitions.write().await;
        let chain = partitions.entry(partition.to_string()).or_default();

        let (expected_position, expected_previous) = ChainTip::next(chain.tip);
        if block.chain_position != expected_position || block.previous_hash != expected_previous {
            return Err(LedgerError::position_conflict(partition, block.chain_position));
        }
        if chain.by_event.contains_key(&block.event.event_id) {
            return Err(LedgerError::InvalidEvent(format!(
                "event {} is already recorded in partition {}",
                block.event.event_id, partition
            )));
        }

        chain.blocks.insert(block.chain_position, block.clone());
        chain
            .by_event
            .insert(block.event.event_id, block.chain_position);
        chain.tip = Some(ChainTip {
            position: block.chain_position,
            content_hash: block.content_hash,
        });

        debug!("Stored block {} in partition {}", block.summary(), partition);
        Ok(())
    }

    async fn get(&self, partition: &str, position: u64) -> LedgerResult<Option<ChainBlock>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition)
            .and_then(|chain| chain.blocks.get(&position))
            .cloned())
    }

    async fn lookup_event(
        &self,
        partition: &str,
        event_id: &Uuid,
    ) -> LedgerResult<Option<StoredBlock>> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(partition).and_then(|chain| {
            chain
                .by_event
                .get(event_id)
                .and_then(|position| chain.blocks.get(position))
                .cloned()
                .map(StoredBlock::Intact)
        }))
    }

    async fn iterate(
        &self,
        partition: &str,
        from_position: u64,
        limit: usize,
    ) -> LedgerResult<Vec<StoredBlock>> {
        let partitions = self.partitions.read().await;
        let Some(chain) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        let Some(tip) = chain.tip else {
            return Ok(Vec::new());
        };
        if from_position > tip.position {
            return Ok(Vec::new());
        }

        Ok(chain
            .blocks
            .range(from_position..=tip.position)
            .take(limit)
            .map(|(_, block)| StoredBlock::Intact(block.clone()))
            .collect())
    }

    async fn tip(&self, partition: &str) -> LedgerResult<Option<ChainTip>> {
        let partitions = self.partitions.read().await;
        Ok(partitions.get(partition).and_then(|chain| chain.tip))
    }

    async fn partitions(&self) -> LedgerResult<Vec<PartitionSummary>> {
        let partitions = self.partitions.read().await;
        let mut summaries: Vec<PartitionSummary> = partitions
            .iter()
            .filter_map(|(name, chain)| {
                chain.tip.map(|tip| PartitionSummary {
                    partition: name.clone(),
                    tip_position: tip.position,
                    tip_hash: tip.content_hash.to_string(),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.partition.cmp(&b.partition));
        Ok(summaries)
    }
}
