//! PostgreSQL implementation of ApplicationStore.

use super::advisory_lock;
use crate::storage_error;
use async_trait::async_trait;
use rollout_core::application::Application;
use rollout_core::ports::{ApplicationStore, LockedApplication};
use rollout_core::{ApplicationId, Error, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::debug;

/// PostgreSQL implementation of ApplicationStore.
pub struct PgApplicationStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgApplicationStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Store a new application. Fails if one with the same id exists.
    pub async fn create(&self, application: &Application) -> Result<()> {
        let data = serde_json::to_value(application)?;
        sqlx::query(
            "INSERT INTO applications (id, tenant, application, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(application.id.to_string())
        .bind(application.id.tenant.as_str())
        .bind(application.id.application.as_str())
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    /// Delete an application, waiting for any holder of its lock.
    pub async fn delete(&self, id: &ApplicationId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        advisory_lock(&mut tx, &id.to_string(), self.lock_timeout).await?;
        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_application(row: &sqlx::postgres::PgRow) -> Result<Application> {
    Ok(serde_json::from_value(row.get("data"))?)
}

#[async_trait]
impl ApplicationStore for PgApplicationStore {
    async fn list(&self) -> Result<Vec<ApplicationId>> {
        let rows = sqlx::query("SELECT tenant, application FROM applications ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows
            .iter()
            .map(|r| {
                ApplicationId::new(r.get::<String, _>("tenant"), r.get::<String, _>("application"))
            })
            .collect())
    }

    async fn get(&self, id: &ApplicationId) -> Result<Option<Application>> {
        let row = sqlx::query("SELECT data FROM applications WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.as_ref().map(row_to_application).transpose()
    }

    async fn lock(&self, id: &ApplicationId) -> Result<Box<dyn LockedApplication>> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        advisory_lock(&mut tx, &id.to_string(), self.lock_timeout).await?;
        debug!(application = %id, "Locked application");

        let row = sqlx::query("SELECT data FROM applications WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_error)?;
        let Some(row) = row else {
            return Err(Error::ApplicationNotFound(id.to_string()));
        };

        Ok(Box::new(PgLockedApplication {
            tx,
            application: row_to_application(&row)?,
        }))
    }
}

/// An application held under its advisory lock. Dropping it rolls back, and releases the lock.
struct PgLockedApplication {
    tx: Transaction<'static, Postgres>,
    application: Application,
}

#[async_trait]
impl LockedApplication for PgLockedApplication {
    fn application(&self) -> &Application {
        &self.application
    }

    async fn store(self: Box<Self>, application: Application) -> Result<()> {
        let PgLockedApplication { mut tx, .. } = *self;
        let data = serde_json::to_value(&application)?;
        sqlx::query("UPDATE applications SET data = $2, updated_at = NOW() WHERE id = $1")
            .bind(application.id.to_string())
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }
}
