//! libsql persistence for pipelines, datacenters and probe outcomes.

pub mod migrations;
pub mod models;
pub mod repository;

pub use repository::Repository;

use anyhow::Result;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
