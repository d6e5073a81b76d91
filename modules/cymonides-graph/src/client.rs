use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Thin wrapper around a Postgres pool providing connection setup.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) pool: PgPool,
}

impl GraphClient {
    /// Connect to Postgres at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying pool.
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}
