//! Repository for tenant consumers.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{Consumer, ConsumerId},
};

/// Repository for the `consumers` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Fetches a consumer by id.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no such consumer exists.
    pub async fn get(&self, id: ConsumerId) -> Result<Consumer> {
        self.get_impl(&*self.pool, id).await
    }

    /// Fetches a consumer within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no such consumer exists.
    pub async fn get_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: ConsumerId,
    ) -> Result<Consumer> {
        self.get_impl(&mut **tx, id).await
    }

    async fn get_impl<'e, E>(&self, executor: E, id: ConsumerId) -> Result<Consumer>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, Consumer>(
            r#"
            SELECT id, tenant_id, external_id, version_id, created_at
            FROM consumers
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("consumer {id}")))
    }
}
