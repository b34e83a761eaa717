use sqlx::Postgres;

use crate::error::Result;

/// Groups queries that must commit atomically.
///
/// sqlx's own `Transaction` already gives sequential, all-or-nothing
/// semantics, so "enqueue" here is simply "await in order against the same
/// handle" — there is no separate queue to drain. Callers that need two
/// enqueued statements to race (e.g. the Injector's independent
/// junction-table inserts) use `try_join!` over two `&mut *txn` borrows
/// taken one after another, never concurrently on the same handle.
pub struct Transaction<'c> {
    inner: sqlx::Transaction<'c, Postgres>,
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(inner: sqlx::Transaction<'c, Postgres>) -> Self {
        Self { inner }
    }

    pub fn as_mut(&mut self) -> &mut sqlx::Transaction<'c, Postgres> {
        &mut self.inner
    }

    /// Seals the transaction. Once this returns `Ok`, every enqueued query
    /// is durable; on any prior query error the transaction is rolled back
    /// by `Drop` instead and this is never reached.
    pub async fn commit(self) -> Result<()> {
        self.inner.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}
