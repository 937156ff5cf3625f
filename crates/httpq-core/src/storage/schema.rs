//! Idempotent bootstrap of the tables the delivery engine relies on.
//!
//! Versioned migrations are left to deployment tooling; this only makes sure
//! a fresh database can run the engine and the integration tests.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tenants (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS versions (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(id),
        version TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS topics (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(id),
        name TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS consumers (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(id),
        external_id TEXT NOT NULL,
        version_id UUID NOT NULL REFERENCES versions(id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscriptions (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL REFERENCES tenants(id),
        consumer_id UUID NOT NULL REFERENCES consumers(id),
        topic_id UUID NOT NULL REFERENCES topics(id),
        url TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_failing BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_subscriptions_binding
    ON subscriptions (tenant_id, consumer_id, topic_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_events (
        id UUID NOT NULL,
        state TEXT NOT NULL,
        tenant_id UUID NOT NULL,
        consumer_id UUID NOT NULL,
        topic_id UUID NOT NULL,
        version_id UUID NOT NULL,
        subscription_id UUID NOT NULL,
        try_count INTEGER NOT NULL DEFAULT 0 CHECK (try_count >= 0),
        request_headers JSONB,
        request_body JSONB,
        url TEXT,
        response_headers JSONB,
        response_body TEXT,
        response_code INTEGER,
        duration_ms BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        delivered_at TIMESTAMPTZ,
        partition_date DATE NOT NULL,
        PRIMARY KEY (id, partition_date)
    ) PARTITION BY RANGE (partition_date)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS main_queue (
        id BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS retry_queue (
        id BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL,
        execute_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_retry_queue_execute_at
    ON retry_queue (execute_at)
    "#,
];

/// Creates every table and index used by httpq if it does not exist yet.
///
/// Partitions of `webhook_events` are not created here; they belong to the
/// partition reconciler.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    debug!(statements = STATEMENTS.len(), "schema ensured");
    Ok(())
}
