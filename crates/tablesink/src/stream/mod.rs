//! Message stream abstraction
//!
//! The consumer loop only needs ordered fetch and per-message acknowledgment. Kafka
//! provides both in production; [`memory::MemorySource`] replays a fixed list in tests.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use kafka::KafkaSource;
pub use memory::MemorySource;

/// One record fetched from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Raw record value; `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

/// When consumed offsets are handed back to the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// After the message reaches a terminal outcome that will not be retried
    /// (at-least-once; a crash before the offset commit replays the message)
    #[default]
    AfterCommit,
    /// As soon as the message is fetched (at-most-once; a crash mid-transaction
    /// loses the message)
    OnReceive,
}

impl AckPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckPolicy::AfterCommit => "after-commit",
            AckPolicy::OnReceive => "on-receive",
        }
    }
}

impl std::str::FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "after-commit" => Ok(AckPolicy::AfterCommit),
            "on-receive" => Ok(AckPolicy::OnReceive),
            other => Err(format!("unknown ack policy '{}', expected after-commit|on-receive", other)),
        }
    }
}

/// Ordered source of deliveries
#[async_trait]
pub trait MessageSource: Send {
    /// Next delivery in stream order; `Ok(None)` when the stream is exhausted
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Mark `delivery` consumed
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Flush pending acknowledgments and release the connection
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
