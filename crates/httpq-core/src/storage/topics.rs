//! Repository for tenant topics.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{TenantId, Topic},
};

/// Repository for the `topics` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a topic of a tenant by name.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the tenant has no such topic.
    pub async fn find_by_name(&self, tenant_id: TenantId, name: &str) -> Result<Topic> {
        self.find_by_name_impl(&*self.pool, tenant_id, name).await
    }

    /// Finds a topic within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the tenant has no such topic.
    pub async fn find_by_name_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
        name: &str,
    ) -> Result<Topic> {
        self.find_by_name_impl(&mut **tx, tenant_id, name).await
    }

    async fn find_by_name_impl<'e, E>(
        &self,
        executor: E,
        tenant_id: TenantId,
        name: &str,
    ) -> Result<Topic>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, Topic>(
            r#"
            SELECT id, tenant_id, name, created_at
            FROM topics
            WHERE tenant_id = $1 AND name = $2
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("topic {name}")))
    }
}
