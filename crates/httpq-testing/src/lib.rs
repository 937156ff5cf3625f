//! Test infrastructure for httpq integration tests.
//!
//! Provides throwaway Postgres databases with the schema and today's
//! partitions in place, and fixture builders for the tenant-side entities
//! an event needs before it can be admitted.

pub mod database;
pub mod fixtures;

pub use database::TestDatabase;
pub use fixtures::TenantFixture;
