//! PostgreSQL storage and locking for the Rollout deployment orchestrator.
//!
//! Applications are stored as JSON documents, and locked with transaction-scoped advisory locks
//! keyed by application id, so the lock is released whenever the transaction ends.

pub mod repositories;

pub use repositories::*;

use rollout_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// How long to wait for an application or queue lock before failing.
    pub lock_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/rollout".to_string(),
            max_connections: 20,
            acquire_timeout_secs: 5,
            lock_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(storage_error)?;

        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout(),
        })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }

    pub fn application_store(&self) -> PgApplicationStore {
        PgApplicationStore::new(self.pool.clone(), self.lock_timeout)
    }

    pub fn retrigger_queue(&self) -> PgRetriggerQueue {
        PgRetriggerQueue::new(self.pool.clone(), self.lock_timeout)
    }
}

pub(crate) fn storage_error(e: sqlx::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Lock timeouts surface as lock failures, which callers may retry.
pub(crate) fn lock_error(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
            Error::Lock(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut => Error::Lock(e.to_string()),
        _ => storage_error(e),
    }
}

/// SQLSTATE of `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";
