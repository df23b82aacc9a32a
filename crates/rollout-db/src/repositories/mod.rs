//! Repository implementations for PostgreSQL.

mod application;
mod retrigger;

pub use application::PgApplicationStore;
pub use retrigger::PgRetriggerQueue;

use crate::lock_error;
use rollout_core::Result;
use sqlx::{Postgres, Transaction};
use std::time::Duration;

/// Take a transaction-scoped advisory lock on `key`, waiting at most `timeout`.
async fn advisory_lock(
    tx: &mut Transaction<'static, Postgres>,
    key: &str,
    timeout: Duration,
) -> Result<()> {
    sqlx::query("SELECT set_config('lock_timeout', $1, true)")
        .bind(format!("{}ms", timeout.as_millis()))
        .execute(&mut **tx)
        .await
        .map_err(lock_error)?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(lock_error)?;
    Ok(())
}
