//! # glimpse-db
//!
//! SQLite storage for the glimpse capture pipeline.
//!
//! This crate provides:
//! - Connection pool management (WAL mode, busy timeout)
//! - The shared task table and its bootstrap
//! - [`SqliteTaskStore`], the durable claim/retry/stale-recovery state machine
//!
//! ## Example
//!
//! ```rust,ignore
//! use glimpse_db::{Database, Stage, TaskPayload, TaskStore};
//!
//! let db = Database::connect("sqlite://glimpse.db").await?;
//! db.tasks
//!     .enqueue(Stage::VisionAnalysis, batch_id, &TaskPayload::screenshots(ids), Utc::now())
//!     .await?;
//! ```

pub mod pool;
pub mod schema;
pub mod tasks;

pub use glimpse_core::*;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use schema::migrate;
pub use tasks::SqliteTaskStore;

use sqlx::SqlitePool;

/// Pool plus the repositories built on it.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: SqlitePool,
    /// Stage task rows.
    pub tasks: SqliteTaskStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: SqliteTaskStore::new(pool.clone()),
            pool,
        }
    }

    /// Open (creating if needed) the database and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_config(database_url, PoolConfig::default()).await
    }

    pub async fn connect_with_config(database_url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(database_url, config).await?;
        migrate(&pool).await?;
        Ok(Self::new(pool))
    }
}
