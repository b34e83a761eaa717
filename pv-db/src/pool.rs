use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::Result;

/// Owns the asynchronous connection pool. One `Store` is built at startup
/// and shared (cheaply cloned) by every connection's command engine.
#[derive(Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Runs the embedded schema migrations. Idempotent: safe to call on
    /// every startup.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Opens a `Transaction` that groups every query enqueued against it
    /// into one atomic commit.
    pub async fn transaction(&self) -> Result<crate::txn::Transaction<'static>> {
        let txn = self.pool.begin().await?;
        Ok(crate::txn::Transaction::new(txn))
    }
}
