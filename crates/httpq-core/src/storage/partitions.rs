//! DDL for the daily partitions of a range-partitioned table.
//!
//! A reconciliation run lists the partitions that exist, diffs them against
//! the desired set and issues every create and drop inside one transaction,
//! so a failed run leaves the table as it was. Drops only ever target
//! partitions observed in the same run.

use std::{collections::BTreeSet, sync::Arc};

use sqlx::{Executor, PgPool, Postgres};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    partition::{DailyPartitionTable, StateReconciliationSet, PARTITION_SEPARATOR},
};

/// Repository for partition DDL.
pub struct Repository {
    pool: Arc<PgPool>,
}

/// `LIKE` pattern matching the partition names of `base_table`.
fn partition_name_pattern(base_table: &str) -> String {
    let escaped = format!("{base_table}{PARTITION_SEPARATOR}").replace('_', "\\_");
    format!("{escaped}%")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Lists the daily partitions of `base_table` that currently exist.
    ///
    /// Tables that share the prefix but do not parse as a daily partition
    /// are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the catalog query fails.
    pub async fn list(&self, base_table: &str) -> Result<BTreeSet<DailyPartitionTable>> {
        self.list_impl(&*self.pool, base_table).await
    }

    async fn list_impl<'e, E>(
        &self,
        executor: E,
        base_table: &str,
    ) -> Result<BTreeSet<DailyPartitionTable>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_name LIKE $1
            "#,
        )
        .bind(partition_name_pattern(base_table))
        .fetch_all(executor)
        .await?;

        let mut partitions = BTreeSet::new();
        for name in names {
            match DailyPartitionTable::parse(&name) {
                Ok(partition) if partition.base_table() == base_table => {
                    partitions.insert(partition);
                },
                Ok(_) => {},
                Err(error) => warn!(table = %name, error = %error, "ignoring unrecognized partition"),
            }
        }

        Ok(partitions)
    }

    /// Brings the partitions of `base_table` in line with `desired`.
    ///
    /// Returns the diff that was applied.
    ///
    /// # Errors
    ///
    /// Returns error if listing, any create or the drop fails; the whole run
    /// is rolled back in that case.
    pub async fn reconcile(
        &self,
        base_table: &str,
        desired: &BTreeSet<DailyPartitionTable>,
    ) -> Result<StateReconciliationSet<DailyPartitionTable>> {
        let mut tx = self.pool.begin().await?;

        let current = self.list_impl(&mut *tx, base_table).await?;
        let diff = StateReconciliationSet::make(&current, desired);

        if diff.is_empty() {
            tx.rollback().await?;
            debug!(base_table, "partitions already reconciled");
            return Ok(diff);
        }

        for partition in &diff.to_add {
            let statement = format!(
                "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
                quote_ident(&partition.partition_name()),
                quote_ident(partition.base_table()),
                partition.range_from(),
                partition.range_to(),
            );
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        if !diff.to_remove.is_empty() {
            let tables: Vec<String> =
                diff.to_remove.iter().map(|p| quote_ident(&p.partition_name())).collect();
            let statement = format!("DROP TABLE IF EXISTS {}", tables.join(", "));
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;

        info!(
            base_table,
            added = diff.to_add.len(),
            removed = diff.to_remove.len(),
            "partitions reconciled"
        );

        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_pattern_escapes_underscores() {
        assert_eq!(partition_name_pattern("webhook_events"), "webhook\\_events\\_\\_%");
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("webhook_events__2020_01_01"), "\"webhook_events__2020_01_01\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
