use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Row counts reported by the status endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub partitions: i64,
    pub blocks: i64,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("Connected to {}", database_url);
        Ok(Database { pool })
    }

    /// Open a database that must already exist. Nothing is created and the
    /// journal mode is left as found, so checking a ledger never writes to it.
    pub async fn open_existing(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(false)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("Opened existing {}", database_url);
        Ok(Database { pool })
    }

    /// Whether the chain tables are present
    pub async fn has_schema(&self) -> Result<bool, sqlx::Error> {
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('chain_blocks', 'chain_heads')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(tables == 2)
    }

    /// Private in-memory database. A single long-lived connection keeps the
    /// data alive for the lifetime of the pool.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Database { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM chain_heads) AS partitions,
                (SELECT COUNT(*) FROM chain_blocks) AS blocks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            partitions: row.try_get("partitions")?,
            blocks: row.try_get("blocks")?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        assert!(!db.pool().is_closed());

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats, DatabaseStats { partitions: 0, blocks: 0 });
    }

    #[tokio::test]
    async fn test_file_database_and_idempotent_migrations() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

        let db = Database::new(&url, 4).await.unwrap();
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();
        db.close().await;

        let reopened = Database::new(&url, 4).await.unwrap();
        reopened.run_migrations().await.unwrap();
        assert_eq!(reopened.get_stats().await.unwrap().blocks, 0);
    }

    #[tokio::test]
    async fn test_open_existing_never_creates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let url = format!("sqlite://{}", path.display());

        assert!(Database::open_existing(&url, 1).await.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_has_schema_after_migrations() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("ledger.db").display());

        let db = Database::new(&url, 1).await.unwrap();
        assert!(!db.has_schema().await.unwrap());
        db.close().await;

        let existing = Database::open_existing(&url, 1).await.unwrap();
        assert!(!existing.has_schema().await.unwrap());
        existing.close().await;

        let db = Database::new(&url, 1).await.unwrap();
        db.run_migrations().await.unwrap();
        db.close().await;

        let existing = Database::open_existing(&url, 1).await.unwrap();
        assert!(existing.has_schema().await.unwrap());
    }
}
