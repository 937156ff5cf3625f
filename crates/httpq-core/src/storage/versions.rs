//! Repository for tenant payload versions.

use std::{collections::HashMap, sync::Arc};

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{TenantId, Version, VersionId},
};

/// Repository for the `versions` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Lists the versions declared by a tenant.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<Version>> {
        self.list_impl(&*self.pool, tenant_id).await
    }

    /// Maps each version id of a tenant to its name.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn as_map_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
    ) -> Result<HashMap<VersionId, String>> {
        let versions = self.list_impl(&mut **tx, tenant_id).await?;
        Ok(versions.into_iter().map(|v| (v.id, v.version)).collect())
    }

    async fn list_impl<'e, E>(&self, executor: E, tenant_id: TenantId) -> Result<Vec<Version>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let versions = sqlx::query_as::<_, Version>(
            r#"
            SELECT id, tenant_id, version, created_at
            FROM versions
            WHERE tenant_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(executor)
        .await?;

        Ok(versions)
    }
}
