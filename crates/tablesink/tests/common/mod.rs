//! Common test utilities for tablesink integration tests using testcontainers
//!
//! Each test starts its own PostgreSQL container, so tests are isolated from each other
//! and need no manual database setup.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestPostgres;
//!
//! #[tokio::test]
//! async fn test_with_postgres() {
//!     let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
//!     sqlx::query("SELECT 1").execute(pg.pool()).await.expect("Query failed");
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// PostgreSQL image tag used by the tests
pub const POSTGRES_TAG: &str = "16-alpine";

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

/// PostgreSQL test container wrapper
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    /// Start a new PostgreSQL container and connect a small pool to it
    ///
    /// # Errors
    ///
    /// Returns an error if the container fails to start or the connection fails.
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag(POSTGRES_TAG)
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string =
            format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get a clone of the database pool
    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    /// Get the connection string
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Whether a relation with this exact (case-sensitive) name exists
    pub async fn relation_exists(&self, relation: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = $1)",
        )
        .bind(relation)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check relation")
    }

    /// `(column_name, data_type)` in declaration order
    pub async fn columns(&self, relation: &str) -> Result<Vec<(String, String)>> {
        sqlx::query_as(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position",
        )
        .bind(relation)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list columns")
    }

    pub async fn row_count(&self, relation: &str) -> Result<i64> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", relation))
            .fetch_one(&self.pool)
            .await
            .context("Failed to count rows")
    }

    /// All rows as text, ordered by the first column
    pub async fn rows(&self, relation: &str, columns: &[&str]) -> Result<Vec<Vec<Option<String>>>> {
        let select = columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM \"{}\" ORDER BY \"{}\"",
            select, relation, columns[0]
        );

        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to read rows")?;

        rows.iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| sqlx::Row::try_get::<Option<String>, _>(row, i))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context("Failed to decode row")
            })
            .collect()
    }
}

/// Initialize tracing for tests
///
/// Safe to call from every test; only the first call installs the subscriber.
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tablesink=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
