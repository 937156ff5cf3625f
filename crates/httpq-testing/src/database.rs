//! Isolated Postgres databases for integration tests.
//!
//! Each test gets its own database created next to the one named by
//! `DATABASE_URL`. The variable is required: a test that cannot reach a
//! database fails instead of passing without running.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use httpq_core::{
    partition::desired_partitions,
    storage::{schema, webhook_events, Storage},
};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tokio::sync::Semaphore;
use tracing::info;
use uuid::Uuid;

// Limits concurrent CREATE DATABASE statements
static DB_CREATION_SEMAPHORE: Semaphore = Semaphore::const_new(3);

/// Days of partitions created around the as-of date of a test database.
const TEST_PARTITION_DAYS: u32 = 7;

/// A database owned by a single test.
pub struct TestDatabase {
    pool: PgPool,
    storage: Storage,
    database_name: String,
}

impl TestDatabase {
    /// Creates a fresh database with partitions around today.
    ///
    /// # Errors
    ///
    /// Fails when `DATABASE_URL` is unset or the server is unreachable.
    pub async fn new() -> Result<Self> {
        Self::with_as_of(chrono::Utc::now().date_naive()).await
    }

    /// Creates a fresh database with partitions around `as_of`.
    pub async fn with_as_of(as_of: NaiveDate) -> Result<Self> {
        let database_url = database_url()?;
        let admin_pool = admin_pool(&database_url).await?;
        let database_name = format!("httpq_test_{}", Uuid::new_v4().simple());

        {
            let _permit = DB_CREATION_SEMAPHORE
                .acquire()
                .await
                .context("database creation semaphore closed")?;
            sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
                .execute(&admin_pool)
                .await
                .with_context(|| format!("failed to create database {database_name}"))?;
        }
        admin_pool.close().await;

        let opts = database_url
            .parse::<PgConnectOptions>()
            .context("failed to parse DATABASE_URL")?
            .database(&database_name);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to connect to {database_name}"))?;

        schema::ensure_schema(&pool).await.context("failed to create schema")?;

        let storage = Storage::new(pool.clone());
        let desired = desired_partitions(
            webhook_events::TABLE_NAME,
            as_of,
            TEST_PARTITION_DAYS,
            TEST_PARTITION_DAYS,
        );
        storage
            .partitions
            .reconcile(webhook_events::TABLE_NAME, &desired)
            .await
            .context("failed to create test partitions")?;

        info!(database = %database_name, %as_of, "created isolated test database");

        Ok(Self { pool, storage, database_name })
    }

    /// Connection pool of the test database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repositories bound to the test database.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Name of the test database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes the pool and drops the database.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let database_url = database_url()?;
        let admin_pool = admin_pool(&database_url).await?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name))
            .execute(&admin_pool)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;
        admin_pool.close().await;

        Ok(())
    }
}

fn database_url() -> Result<String> {
    std::env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")
}

async fn admin_pool(database_url: &str) -> Result<PgPool> {
    let opts = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse DATABASE_URL")?
        .database("postgres");

    PgPoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(opts)
        .await
        .context("failed to connect to admin database")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_database_url_is_an_error() {
        let saved = std::env::var("DATABASE_URL").ok();
        std::env::remove_var("DATABASE_URL");

        let result = TestDatabase::new().await;

        if let Some(url) = saved {
            std::env::set_var("DATABASE_URL", url);
        }
        let error = result.err().expect("creating a test database without DATABASE_URL must fail");
        assert!(error.to_string().contains("DATABASE_URL"));
    }
}
