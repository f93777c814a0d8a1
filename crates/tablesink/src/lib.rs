//! tablesink
//!
//! Streams table-shaped JSON messages from Kafka into PostgreSQL, creating each
//! destination relation on first sight.
//!
//! # Overview
//!
//! Every message names a table, its columns and a list of rows:
//!
//! ```json
//! { "table_name": "Sales Q1", "columns": ["Region", "Amount"], "data": [["east", "100"]] }
//! ```
//!
//! The sink sanitizes the names, provisions `"Sales_Q1"` with one `TEXT` column per declared
//! column if it does not exist yet, and inserts the rows. A message is handled in one
//! transaction, so its rows become visible all together or not at all.
//!
//! # Components
//!
//! - [`identifier`]: raw names to safe SQL identifiers
//! - [`schema`]: idempotent relation provisioning
//! - [`writer`]: paged multi-row inserts
//! - [`coordinator`]: per-message transaction and state machine
//! - [`consumer`]: ordered fetch, retry and acknowledgment policy
//! - [`stream`]: Kafka and in-memory message sources

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod identifier;
pub mod message;
pub mod schema;
pub mod stream;
pub mod writer;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::Config;
pub use consumer::{ConsumerLoop, ConsumerStats, LoopSettings};
pub use coordinator::{Outcome, PgCoordinator, WriteCoordinator};
pub use error::{Disposition, SinkError};
pub use message::TableMessage;

use stream::KafkaSource;

/// Run the sink until `shutdown` fires or an unrecoverable error occurs
///
/// The store pool and the stream consumer are released on every exit path.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<ConsumerStats> {
    let pool = db::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let result = async {
        let source = KafkaSource::connect(&config.kafka, config.sink.ack_policy)
            .context("Failed to subscribe to Kafka")?;
        let coordinator = PgCoordinator::new(pool.clone(), config.sink.insert_page_size);

        let stats = ConsumerLoop::new(source, coordinator, LoopSettings::from(&config.sink), shutdown)
            .run()
            .await
            .context("Consumer stopped on error")?;

        Ok(stats)
    }
    .await;

    pool.close().await;
    info!("Database connection closed");

    result
}
