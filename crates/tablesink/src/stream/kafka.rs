//! Kafka message source
//!
//! Offsets are committed by librdkafka's background auto-commit. With
//! [`AckPolicy::AfterCommit`] automatic offset *storing* is disabled and the sink stores
//! each offset explicitly once the message is done, so only finished messages are ever
//! committed. With [`AckPolicy::OnReceive`] librdkafka stores offsets as messages are
//! handed out.

use async_trait::async_trait;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use tracing::{debug, info, warn};

use super::{AckPolicy, Delivery, MessageSource};
use crate::config::KafkaConfig;
use crate::error::{Result, SinkError};

pub struct KafkaSource {
    consumer: StreamConsumer,
    policy: AckPolicy,
}

impl KafkaSource {
    /// Create the consumer and subscribe to the configured topic
    pub fn connect(config: &KafkaConfig, policy: AckPolicy) -> Result<Self> {
        let consumer: StreamConsumer = client_config(config, policy)
            .create()
            .map_err(stream_err)?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(stream_err)?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group_id = %config.group_id,
            ack_policy = policy.as_str(),
            "Subscribed to stream"
        );

        Ok(Self { consumer, policy })
    }
}

/// librdkafka settings for `config` under `policy`
pub fn client_config(config: &KafkaConfig, policy: AckPolicy) -> ClientConfig {
    let store_on_receive = match policy {
        AckPolicy::AfterCommit => "false",
        AckPolicy::OnReceive => "true",
    };

    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", store_on_receive)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set_log_level(RDKafkaLogLevel::Info);
    client
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let message = self.consumer.recv().await.map_err(stream_err)?;

        Ok(Some(Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        }))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        if self.policy == AckPolicy::OnReceive {
            return Ok(());
        }

        // The stored offset is the next one to read, hence +1.
        self.consumer
            .store_offset(&delivery.topic, delivery.partition, delivery.offset + 1)
            .map_err(stream_err)
    }

    async fn close(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => debug!("Committed consumer offsets"),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("No new offsets to commit")
            },
            Err(e) => warn!(error = %e, "Final offset commit failed"),
        }
        self.consumer.unsubscribe();
        info!("Stream connection released");
        Ok(())
    }
}

fn stream_err(err: KafkaError) -> SinkError {
    SinkError::StreamUnavailable(err.to_string())
}
