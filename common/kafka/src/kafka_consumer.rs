use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use health::ReadinessTracker;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::BorrowedMessage;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{ClientAdapter, Fetch, FetchError};
use crate::config::{KafkaConfig, KafkaConfigError};
use crate::rebalance::ReadinessContext;
use crate::record::Record;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(1);
// used when KAFKA_FETCH_WAIT_MS does not fit in an Instant
const FAR_DEADLINE: Duration = Duration::from_secs(24 * 60 * 60);

/// [`ClientAdapter`] over an rdkafka group consumer subscribed to one topic.
///
/// A poll waits for the first record, then keeps collecting for up to
/// `KAFKA_FETCH_WAIT_MS` or until `KAFKA_FETCH_MAX_RECORDS` records are
/// buffered. Rebalances are reported to the readiness tracker through
/// [`ReadinessContext`].
pub struct KafkaClient {
    consumer: StreamConsumer<ReadinessContext>,
    topic: String,
    max_records: usize,
    fetch_wait: Duration,
    consecutive_errors: AtomicU64,
    closed: AtomicBool,
}

impl KafkaClient {
    pub fn new(config: &KafkaConfig, tracker: ReadinessTracker) -> Result<Self, KafkaConfigError> {
        let consumer: StreamConsumer<ReadinessContext> = config
            .client_config()?
            .create_with_context(ReadinessContext::new(tracker))?;

        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;
        info!(
            topic = %config.kafka_consumer_topic,
            group = %config.kafka_consumer_group,
            "subscribed to topic"
        );

        Ok(Self {
            consumer,
            topic: config.kafka_consumer_topic.clone(),
            max_records: config.kafka_fetch_max_records.max(1),
            fetch_wait: Duration::from_millis(config.kafka_fetch_wait_ms),
            consecutive_errors: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    // Returns false if the consumer reported an error instead of a message.
    fn accept(&self, next: KafkaResult<BorrowedMessage<'_>>, fetch: &mut Fetch) -> bool {
        match next {
            Ok(message) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                fetch.push_record(Record::from_message(&message));
                true
            }
            Err(e) => {
                _ = self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                fetch.push_error(FetchError::new(&self.topic, None, e.into()));
                false
            }
        }
    }

    // Linear in consecutive errors, capped at MAX_ERROR_BACKOFF.
    async fn backoff(&self, shutdown: &CancellationToken) {
        let errors = self.consecutive_errors.load(Ordering::Relaxed);
        let delay = Duration::from_millis(errors.saturating_mul(100)).min(MAX_ERROR_BACKOFF);
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(delay) => {}
        }
    }
}

#[async_trait]
impl ClientAdapter for KafkaClient {
    async fn poll(&self, shutdown: &CancellationToken) -> Fetch {
        let mut fetch = Fetch::new_with_size_hint(self.max_records);

        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return fetch,
            next = self.consumer.recv() => next,
        };
        if !self.accept(first, &mut fetch) {
            self.backoff(shutdown).await;
            return fetch;
        }

        let deadline = batch_deadline(self.fetch_wait);
        while fetch.record_count() < self.max_records {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep_until(deadline) => break,
                next = self.consumer.recv() => next,
            };
            if !self.accept(next, &mut fetch) {
                break;
            }
        }

        fetch
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consumer.unsubscribe();
        info!(topic = %self.topic, "kafka consumer closed");
    }
}

impl Drop for KafkaClient {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(topic = %self.topic, "kafka consumer dropped without close");
        }
    }
}

fn batch_deadline(fetch_wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(fetch_wait).unwrap_or_else(|| now + FAR_DEADLINE)
}
