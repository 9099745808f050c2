//! `PostgreSQL` case store for the census case processor.
//!
//! Implements [`CaseStore`] and [`OutboxStore`] from `census-rm-core` on a
//! single connection pool:
//!
//! - Cases, UAC/QID links and the audit log in one transaction per message
//! - Row locks (`SELECT ... FOR UPDATE`) to serialize concurrent updates of
//!   the same case
//! - Case reference sequence numbers from `case_ref_seq`
//! - A transactional outbox polled with `FOR UPDATE SKIP LOCKED`
//!
//! # Example
//!
//! ```ignore
//! use census_rm_postgres::PostgresCaseStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresCaseStore::new("postgres://localhost/rm").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod outbox;
mod rows;
mod transaction;

pub use transaction::PostgresTransaction;

use census_rm_core::error::StoreError;
use census_rm_core::store::{CaseStore, StoreFuture, StoreTransaction};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Default pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// `PostgreSQL`-backed [`CaseStore`] and [`OutboxStore`](census_rm_core::store::OutboxStore).
#[derive(Clone)]
pub struct PostgresCaseStore {
    pool: PgPool,
}

impl PostgresCaseStore {
    /// Connect with the default pool size.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::connect(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::info!(max_connections, "Connected to case database");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or upgrade the schema (cases, links, events, outbox and the
    /// case reference sequence).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl CaseStore for PostgresCaseStore {
    fn begin(&self) -> StoreFuture<'_, Box<dyn StoreTransaction>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::DatabaseError(format!("Failed to start transaction: {e}")))?;
            Ok(Box::new(PostgresTransaction::new(tx)) as Box<dyn StoreTransaction>)
        })
    }
}

/// Map a write error, turning unique violations into [`StoreError::Conflict`].
pub(crate) fn write_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        },
        _ => StoreError::DatabaseError(error.to_string()),
    }
}
