//! PostgreSQL container for storage tests.

use rollout_db::DatabaseConfig;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

const DATABASE: &str = "rollout";
const USER: &str = "rollout";

/// A throwaway `rollout` database. The container stops when this is dropped.
pub struct RolloutPostgres {
    _container: ContainerAsync<Postgres>,
    url: String,
}

impl RolloutPostgres {
    pub async fn start() -> anyhow::Result<Self> {
        let container = Postgres::default()
            .with_db_name(DATABASE)
            .with_user(USER)
            .with_password(USER)
            .with_tag("16-alpine")
            .start()
            .await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgres://{USER}:{USER}@{host}:{port}/{DATABASE}");

        Ok(Self {
            _container: container,
            url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Settings for this database, with short lock waits so contention shows up quickly in tests.
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            max_connections: 5,
            lock_timeout_secs: 1,
            ..DatabaseConfig::new(self.url.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires docker"]
    async fn test_rollout_database_starts() {
        let postgres = RolloutPostgres::start().await.unwrap();
        assert!(postgres.url().ends_with("/rollout"));
        assert_eq!(postgres.database_config().lock_timeout_secs, 1);
    }
}
