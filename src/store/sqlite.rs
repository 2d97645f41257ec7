use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChainStore, CorruptBlock, PartitionSummary, StoredBlock};
use crate::audit::block::{ChainBlock, ChainTip, ContentHash};
use crate::audit::codec;
use crate::error::{LedgerError, LedgerResult};

const BLOCK_COLUMNS: &str =
    "chain_position, event_bytes, content_hash, previous_hash, signature, signer_key_id";

// SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT
const CONTENTION_CODES: [&str; 3] = ["5", "6", "517"];

/// Chain store on the `chain_blocks` / `chain_heads` tables
#[derive(Clone)]
pub struct SqliteChainStore {
    pool: SqlitePool,
}

impl SqliteChainStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn db_position(position: u64) -> LedgerResult<i64> {
        i64::try_from(position).map_err(|_| {
            LedgerError::StorageUnavailable(format!("position {} exceeds storage range", position))
        })
    }

    /// Classify an error raised while appending
    fn append_error(err: sqlx::Error, partition: &str, block: &ChainBlock) -> LedgerError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                if db_err.message().contains("event_id") {
                    return LedgerError::InvalidEvent(format!(
                        "event {} is already recorded in partition {}",
                        block.event.event_id, partition
                    ));
                }
                return LedgerError::position_conflict(partition, block.chain_position);
            }
            let contended = db_err
                .code()
                .map(|code| CONTENTION_CODES.contains(&&*code))
                .unwrap_or(false);
            if contended {
                return LedgerError::position_conflict(partition, block.chain_position);
            }
        }
        LedgerError::from(err)
    }

    fn row_to_stored(row: &SqliteRow) -> LedgerResult<StoredBlock> {
        let position: i64 = row.try_get("chain_position")?;
        let chain_position = position as u64;
        let event_bytes: Vec<u8> = row.try_get("event_bytes")?;
        let content_hash: String = row.try_get("content_hash")?;
        let previous_hash: String = row.try_get("previous_hash")?;
        let signature: String = row.try_get("signature")?;
        let signer_key_id: String = row.try_get("signer_key_id")?;

        let parsed = codec::decode(&event_bytes)
            .map_err(|e| e.to_string())
            .and_then(|event| {
                let content: ContentHash = content_hash
                    .parse()
                    .map_err(|e| format!("content_hash: {}", e))?;
                let previous: ContentHash = previous_hash
                    .parse()
                    .map_err(|e| format!("previous_hash: {}", e))?;
                Ok((event, content, previous))
            });

        Ok(match parsed {
            Ok((event, content, previous)) => StoredBlock::Intact(ChainBlock {
                event,
                content_hash: content,
                previous_hash: previous,
                chain_position,
                signature,
                signer_key_id,
            }),
            Err(reason) => StoredBlock::Corrupt(CorruptBlock {
                chain_position,
                reason,
                content_hash,
                previous_hash,
                signature,
                signer_key_id,
            }),
        })
    }

    fn row_to_block(row: &SqliteRow) -> LedgerResult<ChainBlock> {
        match Self::row_to_stored(row)? {
            StoredBlock::Intact(block) => Ok(block),
            StoredBlock::Corrupt(corrupt) => Err(LedgerError::MalformedEvent(format!(
                "block {}: {}",
                corrupt.chain_position, corrupt.reason
            ))),
        }
    }
}

#[async_trait]
impl ChainStore for SqliteChainStore {
    async fn append(&self, partition: &str, block: &ChainBlock) -> LedgerResult<()> {
        let position = Self::db_position(block.chain_position)?;
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::append_error(e, partition, block))?;

        // Compare-and-swap on the partition head: it only moves if it still
        // points at this block's predecessor.
        let head_update = if block.chain_position == 0 {
            if !block.previous_hash.is_genesis() {
                return Err(LedgerError::position_conflict(partition, 0));
            }
            sqlx::query(
                r#"
                INSERT INTO chain_heads (partition, tip_position, tip_hash, updated_at)
                VALUES (?, 0, ?, ?)
                ON CONFLICT (partition) DO NOTHING
                "#,
            )
            .bind(partition)
            .bind(block.content_hash.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE chain_heads
                SET tip_position = ?, tip_hash = ?, updated_at = ?
                WHERE partition = ? AND tip_position = ? AND tip_hash = ?
                "#,
            )
            .bind(position)
            .bind(block.content_hash.to_string())
            .bind(now)
            .bind(partition)
            .bind(position - 1)
            .bind(block.previous_hash.to_string())
            .execute(&mut *tx)
            .await
        };
        let advanced = head_update
            .map_err(|e| Self::append_error(e, partition, block))?
            .rows_affected();

        if advanced != 1 {
            debug!(
                "Head of {} moved before block {} could be appended",
                partition, block.chain_position
            );
            return Err(LedgerError::position_conflict(partition, block.chain_position));
        }

        sqlx::query(
            r#"
            INSERT INTO chain_blocks
            (partition, chain_position, event_id, event_bytes, content_hash, previous_hash, signature, signer_key_id, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(partition)
        .bind(position)
        .bind(block.event.event_id.to_string())
        .bind(codec::canonicalize(&block.event))
        .bind(block.content_hash.to_string())
        .bind(block.previous_hash.to_string())
        .bind(&block.signature)
        .bind(&block.signer_key_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::append_error(e, partition, block))?;

        tx.commit()
            .await
            .map_err(|e| Self::append_error(e, partition, block))?;

        debug!("Stored block {} in partition {}", block.summary(), partition);
        Ok(())
    }

    async fn get(&self, partition: &str, position: u64) -> LedgerResult<Option<ChainBlock>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chain_blocks WHERE partition = ? AND chain_position = ?",
            BLOCK_COLUMNS
        ))
        .bind(partition)
        .bind(Self::db_position(position)?)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_block).transpose()
    }

    async fn lookup_event(
        &self,
        partition: &str,
        event_id: &Uuid,
    ) -> LedgerResult<Option<StoredBlock>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM chain_blocks WHERE partition = ? AND event_id = ?",
            BLOCK_COLUMNS
        ))
        .bind(partition)
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_stored).transpose()
    }

    async fn iterate(
        &self,
        partition: &str,
        from_position: u64,
        limit: usize,
    ) -> LedgerResult<Vec<StoredBlock>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM chain_blocks
            WHERE partition = ?
              AND chain_position >= ?
              AND chain_position <= (SELECT tip_position FROM chain_heads WHERE partition = ?)
            ORDER BY chain_position ASC
            LIMIT ?
            "#,
            BLOCK_COLUMNS
        ))
        .bind(partition)
        .bind(Self::db_position(from_position)?)
        .bind(partition)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut blocks = Vec::with_capacity(rows.len());
        for row in &rows {
            let stored = Self::row_to_stored(row)?;
            if let StoredBlock::Corrupt(corrupt) = &stored {
                warn!(
                    "Undecodable block {} in partition {}: {}",
                    corrupt.chain_position, partition, corrupt.reason
                );
            }
            blocks.push(stored);
        }
        Ok(blocks)
    }

    async fn tip(&self, partition: &str) -> LedgerResult<Option<ChainTip>> {
        let row = sqlx::query("SELECT tip_position, tip_hash FROM chain_heads WHERE partition = ?")
            .bind(partition)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let position: i64 = row.try_get("tip_position")?;
        let hash: String = row.try_get("tip_hash")?;
        let content_hash = hash.parse().map_err(|e| {
            LedgerError::MalformedEvent(format!("corrupt head for partition {}: {}", partition, e))
        })?;

        Ok(Some(ChainTip {
            position: position as u64,
            content_hash,
        }))
    }

    async fn partitions(&self) -> LedgerResult<Vec<PartitionSummary>> {
        let rows = sqlx::query(
            "SELECT partition, tip_position, tip_hash FROM chain_heads ORDER BY partition ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> LedgerResult<PartitionSummary> {
                let tip_position: i64 = row.try_get("tip_position")?;
                Ok(PartitionSummary {
                    partition: row.try_get("partition")?,
                    tip_position: tip_position as u64,
                    tip_hash: row.try_get("tip_hash")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{Actor, AuditEvent, EventType, Outcome, Resource};
    use crate::database::Database;

    async fn setup_store() -> SqliteChainStore {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        SqliteChainStore::new(db.pool().clone())
    }

    fn block_after(tip: Option<ChainTip>, action: &str) -> ChainBlock {
        let event = AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: EventType::ConfigurationChange,
            actor: Actor {
                user_id: "admin".to_string(),
                org_id: "org1".to_string(),
            },
            resource: Resource {
                resource_type: "setting".to_string(),
                resource_id: "retention".to_string(),
            },
            action: action.to_string(),
            outcome: Outcome::success().with_detail("days", 90i64),
            risk_score: Some(10),
            correction_of: None,
        };
        let (chain_position, previous_hash) = ChainTip::next(tip);
        ChainBlock {
            content_hash: ContentHash::of_event(&event),
            event,
            previous_hash,
            chain_position,
            signature: "00".repeat(64),
            signer_key_id: "test-key".to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_get_and_tip() {
        let store = setup_store().await;
        assert_eq!(store.tip("org1").await.unwrap(), None);

        let first = block_after(None, "update");
        store.append("org1", &first).await.unwrap();
        let second = block_after(store.tip("org1").await.unwrap(), "update-again");
        store.append("org1", &second).await.unwrap();

        let tip = store.tip("org1").await.unwrap().unwrap();
        assert_eq!(tip.position, 1);
        assert_eq!(tip.content_hash, second.content_hash);

        assert_eq!(store.get("org1", 0).await.unwrap(), Some(first));
        assert_eq!(
            store
                .get_by_event_id("org1", &second.event.event_id)
                .await
                .unwrap(),
            Some(second.clone())
        );
        assert_eq!(
            store
                .get_by_event_id("org2", &second.event.event_id)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_stale_tip_is_a_conflict() {
        let store = setup_store().await;
        store.append("org1", &block_after(None, "a")).await.unwrap();

        let stale = block_after(None, "b");
        assert!(matches!(
            store.append("org1", &stale).await,
            Err(LedgerError::PositionConflict { position: 0, .. })
        ));

        let tip = store.tip("org1").await.unwrap();
        let mut wrong_parent = block_after(tip, "c");
        wrong_parent.previous_hash = ContentHash::digest(b"elsewhere");
        assert!(matches!(
            store.append("org1", &wrong_parent).await,
            Err(LedgerError::PositionConflict { position: 1, .. })
        ));

        assert_eq!(store.tip_position("org1").await.unwrap(), Some(0));
        assert_eq!(store.iterate("org1", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rolls_back() {
        let store = setup_store().await;
        let first = block_after(None, "a");
        store.append("org1", &first).await.unwrap();

        let mut replay = block_after(store.tip("org1").await.unwrap(), "a");
        replay.event.event_id = first.event.event_id;
        replay.content_hash = ContentHash::of_event(&replay.event);
        assert!(matches!(
            store.append("org1", &replay).await,
            Err(LedgerError::InvalidEvent(_))
        ));
        // the head update was rolled back with the failed insert
        assert_eq!(store.tip_position("org1").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_reported() {
        let store = setup_store().await;
        store.append("org1", &block_after(None, "a")).await.unwrap();
        let second = block_after(store.tip("org1").await.unwrap(), "b");
        store.append("org1", &second).await.unwrap();

        sqlx::query("UPDATE chain_blocks SET event_bytes = ? WHERE chain_position = 1")
            .bind(vec![0x09u8, 0x00])
            .execute(&store.pool)
            .await
            .unwrap();

        let blocks = store.iterate("org1", 0, 10).await.unwrap();
        assert!(matches!(blocks[0], StoredBlock::Intact(_)));
        assert!(matches!(
            &blocks[1],
            StoredBlock::Corrupt(CorruptBlock { chain_position: 1, .. })
        ));
        assert!(matches!(
            store.get("org1", 1).await,
            Err(LedgerError::MalformedEvent(_))
        ));

        match store.lookup_event("org1", &second.event.event_id).await.unwrap() {
            Some(StoredBlock::Corrupt(corrupt)) => {
                assert_eq!(corrupt.chain_position, 1);
                assert_eq!(corrupt.content_hash, second.content_hash.to_string());
                assert_eq!(corrupt.signer_key_id, "test-key");
            }
            other => panic!("expected a corrupt row, got {:?}", other),
        }
        assert!(matches!(
            store.get_by_event_id("org1", &second.event.event_id).await,
            Err(LedgerError::MalformedEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_partitions_listing() {
        let store = setup_store().await;
        store.append("beta", &block_after(None, "a")).await.unwrap();
        store.append("alpha", &block_after(None, "b")).await.unwrap();

        let names: Vec<String> = store
            .partitions()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.partition)
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
