//! PostgreSQL implementation of RetriggerQueue.

use super::advisory_lock;
use crate::storage_error;
use async_trait::async_trait;
use rollout_core::Result;
use rollout_core::ports::{LockedRetriggerQueue, RetriggerEntry, RetriggerQueue};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

const LOCK_KEY: &str = "retrigger_queue";

/// PostgreSQL implementation of RetriggerQueue, as a single row holding all entries.
pub struct PgRetriggerQueue {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgRetriggerQueue {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }
}

#[async_trait]
impl RetriggerQueue for PgRetriggerQueue {
    async fn lock(&self) -> Result<Box<dyn LockedRetriggerQueue>> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        advisory_lock(&mut tx, LOCK_KEY, self.lock_timeout).await?;

        let row = sqlx::query("SELECT entries FROM retrigger_queue WHERE id = 1")
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_error)?;
        let entries = match row {
            Some(row) => serde_json::from_value(row.get("entries"))?,
            None => Vec::new(),
        };

        Ok(Box::new(PgLockedRetriggerQueue { tx, entries }))
    }
}

struct PgLockedRetriggerQueue {
    tx: Transaction<'static, Postgres>,
    entries: Vec<RetriggerEntry>,
}

#[async_trait]
impl LockedRetriggerQueue for PgLockedRetriggerQueue {
    fn entries(&self) -> &[RetriggerEntry] {
        &self.entries
    }

    async fn write(self: Box<Self>, entries: Vec<RetriggerEntry>) -> Result<()> {
        let PgLockedRetriggerQueue { mut tx, .. } = *self;
        let data = serde_json::to_value(&entries)?;
        sqlx::query(
            r#"INSERT INTO retrigger_queue (id, entries) VALUES (1, $1)
               ON CONFLICT (id) DO UPDATE SET entries = EXCLUDED.entries, updated_at = NOW()"#,
        )
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }
}
