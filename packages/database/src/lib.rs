#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Dataset and location persistence for the address map.
//!
//! Ingestion and search only see the [`LocationStore`] trait.
//! [`postgres::PostgresStore`] backs it with raw SQL through
//! `switchy_database`; [`memory::MemoryStore`] keeps the same semantics in
//! process for tests and local runs. Schema changes live in the workspace
//! `migrations/` directory and are embedded at build time.

pub mod db;
pub mod memory;
pub mod postgres;
pub mod store;

pub use store::LocationStore;

use include_dir::{Dir, include_dir};
use switchy_database::Database;
use switchy_schema::discovery::embedded::EmbeddedMigrationSource;
use switchy_schema::runner::MigrationRunner;

static MIGRATIONS_DIR: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/../../migrations");

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The query failed or the connection was lost.
    #[error("Database error: {0}")]
    Database(#[from] switchy_database::DatabaseError),

    /// A schema migration could not be applied.
    #[error("Migration error: {0}")]
    Migration(#[from] switchy_schema::MigrationError),

    /// A row did not decode into a dataset or location.
    #[error("Malformed row: {message}")]
    Row {
        /// Which column or value was wrong.
        message: String,
    },
}

/// Applies the embedded migrations that have not run yet.
///
/// # Errors
///
/// Returns [`DbError::Migration`] if a migration fails.
pub async fn run_migrations(db: &dyn Database) -> Result<(), DbError> {
    let runner = MigrationRunner::new(Box::new(EmbeddedMigrationSource::new(&MIGRATIONS_DIR)));
    runner.run(db).await?;
    log::info!("Schema is up to date");
    Ok(())
}
