//! Ledger database module - SQLite-backed storage for the message buffer,
//! memories, topics and heatmap state.
pub mod schema;
pub mod migration;
pub mod message_store;
pub mod memory_store;
pub mod topic_store;
pub mod heatmap_store;
pub use schema::*;
pub use migration::MigrationManager;
pub use message_store::{MessageStore, NewMessage};
pub use memory_store::{MemoryStore, NewMemory};
pub use topic_store::TopicStore;
pub use heatmap_store::HeatmapStore;
use crate::error::LedgerResult;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::TransactionBehavior;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Owns the connection pool and the per-table stores built on top of it.
pub struct MemoryDatabase {
    pub messages: MessageStore,
    pub memories: MemoryStore,
    pub topics: TopicStore,
    pub heatmap: HeatmapStore,
    pool: Arc<DbPool>,
}

impl MemoryDatabase {
    /// Opens (or creates) an on-disk database in WAL mode and applies pending migrations.
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening ledger database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(CONNECTION_PRAGMAS)?;
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        Self::from_pool(pool)
    }

    /// Single-connection in-memory database; every pooled checkout sees the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> anyhow::Result<Self> {
        {
            let mut conn = pool.get()?;
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }
        let pool = Arc::new(pool);
        info!("Ledger database initialized successfully");
        Ok(Self {
            messages: MessageStore::new(Arc::clone(&pool)),
            memories: MemoryStore::new(Arc::clone(&pool)),
            topics: TopicStore::new(Arc::clone(&pool)),
            heatmap: HeatmapStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    pub fn get_conn(&self) -> LedgerResult<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Runs `f` inside one `BEGIN IMMEDIATE` transaction. The transaction commits
    /// only when `f` succeeds; any error rolls every statement back.
    pub fn with_transaction<T, F>(&self, f: F) -> LedgerResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> LedgerResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub fn get_stats(&self) -> LedgerResult<DatabaseStats> {
        let conn = self.get_conn()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    pub fn run_maintenance(&self) -> LedgerResult<()> {
        let mut conn = self.get_conn()?;
        Ok(migration::run_maintenance(&mut conn)?)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!("WAL checkpoint on shutdown failed: {}", e);
            }
        }
    }
}
