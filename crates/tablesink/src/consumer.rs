//! Consumer loop
//!
//! Fetches deliveries strictly in order and drives each one to a terminal outcome before
//! the next fetch. Shutdown is observed only between messages (and during retry backoff,
//! where the in-flight message has already rolled back and is left unacknowledged).

use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SinkConfig;
use crate::coordinator::{Outcome, WriteCoordinator};
use crate::error::{Disposition, Result};
use crate::message::TableMessage;
use crate::stream::{AckPolicy, Delivery, MessageSource};

/// Loop tuning, usually taken from [`SinkConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub ack_policy: AckPolicy,
    pub storage_retry_limit: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub stream_failure_limit: u32,
    /// Messages between progress log lines; 0 disables them
    pub stats_interval: u64,
}

impl From<&SinkConfig> for LoopSettings {
    fn from(config: &SinkConfig) -> Self {
        Self {
            ack_policy: config.ack_policy,
            storage_retry_limit: config.storage_retry_limit,
            retry_backoff: config.retry_backoff(),
            max_retry_backoff: config.max_retry_backoff(),
            stream_failure_limit: config.stream_failure_limit,
            stats_interval: config.stats_interval,
        }
    }
}

/// Running totals for one consumer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub skipped: u64,
    pub decode_failures: u64,
    pub retries: u64,
    pub rows_written: u64,
}

impl ConsumerStats {
    fn log(&self, message: &str) {
        info!(
            received = self.received,
            committed = self.committed,
            rolled_back = self.rolled_back,
            skipped = self.skipped,
            decode_failures = self.decode_failures,
            retries = self.retries,
            rows_written = self.rows_written,
            "{}",
            message
        );
    }
}

/// Delay before retry number `attempt` (1-based): `initial * 2^(attempt - 1)`, capped at `max`
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    initial.saturating_mul(factor).min(max)
}

enum Step {
    Continue,
    Stop,
}

pub struct ConsumerLoop<S, C> {
    source: S,
    coordinator: C,
    settings: LoopSettings,
    shutdown: CancellationToken,
    stats: ConsumerStats,
}

impl<S, C> ConsumerLoop<S, C>
where
    S: MessageSource,
    C: WriteCoordinator,
{
    pub fn new(source: S, coordinator: C, settings: LoopSettings, shutdown: CancellationToken) -> Self {
        Self {
            source,
            coordinator,
            settings,
            shutdown,
            stats: ConsumerStats::default(),
        }
    }

    /// Consume until shutdown, end of stream, or an error that cannot be absorbed
    ///
    /// The source is closed on every exit path.
    pub async fn run(mut self) -> Result<ConsumerStats> {
        info!(ack_policy = self.settings.ack_policy.as_str(), "Consumer started");

        let result = self.consume().await;

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "Failed to close message source");
        }
        self.stats.log("Consumer stopped");

        result.map(|()| self.stats)
    }

    async fn consume(&mut self) -> Result<()> {
        let mut stream_failures = 0u32;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                },
                fetched = self.source.next() => fetched,
            };

            let delivery = match fetched {
                Ok(Some(delivery)) => {
                    stream_failures = 0;
                    delivery
                },
                Ok(None) => {
                    info!("Message stream ended");
                    return Ok(());
                },
                Err(e) => {
                    stream_failures += 1;
                    if stream_failures >= self.settings.stream_failure_limit {
                        error!(error = %e, failures = stream_failures, "Message stream unavailable, giving up");
                        return Err(e);
                    }

                    let delay = backoff_delay(
                        stream_failures,
                        self.settings.retry_backoff,
                        self.settings.max_retry_backoff,
                    );
                    warn!(error = %e, failures = stream_failures, delay_ms = delay.as_millis() as u64, "Message stream error, backing off");
                    if !self.pause(delay).await {
                        return Ok(());
                    }
                    continue;
                },
            };

            let span = info_span!("message", partition = delivery.partition, offset = delivery.offset);
            match self.handle(&delivery).instrument(span).await? {
                Step::Continue => {},
                Step::Stop => return Ok(()),
            }
        }
    }

    async fn handle(&mut self, delivery: &Delivery) -> Result<Step> {
        self.stats.received += 1;

        if self.settings.ack_policy == AckPolicy::OnReceive {
            self.acknowledge(delivery).await;
        }

        let message = match delivery.payload.as_deref() {
            None => {
                debug!("Skipping tombstone");
                self.stats.skipped += 1;
                None
            },
            Some(payload) => match TableMessage::decode(payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable message");
                    self.stats.decode_failures += 1;
                    None
                },
            },
        };

        if let Some(message) = message {
            if let Step::Stop = self.process(&message).await? {
                return Ok(Step::Stop);
            }
        }

        if self.settings.ack_policy == AckPolicy::AfterCommit {
            self.acknowledge(delivery).await;
        }

        if self.settings.stats_interval > 0 && self.stats.received % self.settings.stats_interval == 0 {
            self.stats.log("Consumer progress");
        }

        Ok(Step::Continue)
    }

    /// Drive one message to a terminal outcome, retrying while the store is unavailable
    async fn process(&mut self, message: &TableMessage) -> Result<Step> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let (relation, failed_in, cause) = match self.coordinator.process(message).await {
                Outcome::Committed { rows, .. } => {
                    self.stats.committed += 1;
                    self.stats.rows_written += rows;
                    return Ok(Step::Continue);
                },
                Outcome::Skipped { reason } => {
                    warn!(reason = %reason, "Skipping malformed message");
                    self.stats.skipped += 1;
                    return Ok(Step::Continue);
                },
                Outcome::RolledBack {
                    relation,
                    failed_in,
                    cause,
                } => (relation, failed_in, cause),
            };

            match cause.disposition() {
                Disposition::Skip | Disposition::Drop => {
                    self.stats.rolled_back += 1;
                    warn!(
                        relation = %relation,
                        failed_in = failed_in.as_str(),
                        kind = cause.kind(),
                        "Dropping message after rollback"
                    );
                    return Ok(Step::Continue);
                },
                Disposition::Retry if attempt < self.settings.storage_retry_limit => {
                    self.stats.retries += 1;
                    let delay = backoff_delay(
                        attempt,
                        self.settings.retry_backoff,
                        self.settings.max_retry_backoff,
                    );
                    warn!(
                        relation = %relation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "Store unavailable, retrying message"
                    );
                    if !self.pause(delay).await {
                        info!("Shutdown requested during backoff, message left unacknowledged");
                        return Ok(Step::Stop);
                    }
                },
                Disposition::Retry | Disposition::Fatal => {
                    self.stats.rolled_back += 1;
                    error!(
                        relation = %relation,
                        attempts = attempt,
                        error = %cause,
                        "Giving up on message, leaving it unacknowledged"
                    );
                    return Err(cause);
                },
            }
        }
    }

    async fn acknowledge(&mut self, delivery: &Delivery) {
        if let Err(e) = self.source.ack(delivery).await {
            // The message will be redelivered; its rows may then be written twice.
            warn!(error = %e, "Failed to acknowledge message");
        }
    }

    /// Sleep for `delay`; false if shutdown was requested first
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
