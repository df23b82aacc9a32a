//! Test context backed by a PostgreSQL container.

use crate::containers::RolloutPostgres;
use rollout_db::Database;

/// A migrated database in its own container.
///
/// Drop this to stop the container.
pub struct TestContext {
    pub postgres: RolloutPostgres,
    pub db: Database,
}

impl TestContext {
    pub async fn new() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = RolloutPostgres::start().await?;
        let db = Database::connect(&postgres.database_config()).await?;
        db.migrate().await?;

        Ok(Self { postgres, db })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.url()
    }
}
