use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use common_kafka::{ClientAdapter, Fetch, Record};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics_consts::{BATCH_SIZE, FETCH_ERRORS, PROCESSING_TASKS_FAILED};
use crate::processor::Processor;

/// How the records of one batch are spread over tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// One task per record, no ordering between records.
    #[default]
    Parallel,
    /// One task per partition, records processed in delivery order.
    Partition,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDispatchModeError(String);

impl FromStr for DispatchMode {
    type Err = ParseDispatchModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parallel" => Ok(DispatchMode::Parallel),
            "partition" => Ok(DispatchMode::Partition),
            _ => Err(ParseDispatchModeError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub mode: DispatchMode,
    /// Upper bound on records processed at once within a batch. 0 means unbounded.
    pub max_concurrent_records: usize,
    /// Skip a whole batch when the poll that produced it reported errors.
    pub drop_batch_on_fetch_error: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Parallel,
            max_concurrent_records: 0,
            drop_batch_on_fetch_error: true,
        }
    }
}

/// The poll loop: fetch a batch, process every record, wait for all of them,
/// repeat until shutdown.
pub struct Consumer {
    client: Arc<dyn ClientAdapter>,
    processor: Arc<dyn Processor>,
    options: DispatchOptions,
    limiter: Option<Arc<Semaphore>>,
}

impl Consumer {
    pub fn new(
        client: Arc<dyn ClientAdapter>,
        processor: Arc<dyn Processor>,
        options: DispatchOptions,
    ) -> Self {
        let limiter = (options.max_concurrent_records > 0)
            .then(|| Arc::new(Semaphore::new(options.max_concurrent_records)));

        Self {
            client,
            processor,
            options,
            limiter,
        }
    }

    /// Runs until `shutdown` is cancelled. Cancellation is only checked
    /// between batches: a batch that was fetched is always fully processed.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(mode = ?self.options.mode, "consumer loop started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let fetch = self.client.poll(&shutdown).await;

            if fetch.error_count() > 0 {
                for e in fetch.errors() {
                    let partition = e
                        .partition
                        .map_or_else(|| "unknown".to_string(), |p| p.to_string());
                    error!(
                        topic = %e.topic,
                        partition = %partition,
                        "fetch error: {:#}",
                        e.error
                    );
                    metrics::counter!(FETCH_ERRORS, "topic" => e.topic.clone(), "partition" => partition)
                        .increment(1);
                }
                if self.options.drop_batch_on_fetch_error {
                    warn!(
                        records = fetch.record_count(),
                        "dropping batch with fetch errors"
                    );
                    continue;
                }
            }

            if fetch.record_count() == 0 {
                continue;
            }

            self.dispatch(fetch).await;
        }

        info!("consumer loop stopped");
    }

    // Returns once every record of the batch has been processed.
    async fn dispatch(&self, fetch: Fetch) {
        let count = fetch.record_count();
        metrics::histogram!(BATCH_SIZE).record(count as f64);
        debug!(records = count, "dispatching batch");

        let mut tasks = JoinSet::new();
        match self.options.mode {
            DispatchMode::Parallel => fetch.each_record(|record| {
                let processor = self.processor.clone();
                let limiter = self.limiter.clone();
                drop(tasks.spawn(async move {
                    let _permit = acquire(limiter).await;
                    process(processor.as_ref(), &record).await;
                }));
            }),
            DispatchMode::Partition => {
                let mut lanes: BTreeMap<(String, i32), Vec<Record>> = BTreeMap::new();
                fetch.each_record(|record| {
                    lanes
                        .entry((record.topic().to_owned(), record.partition()))
                        .or_default()
                        .push(record)
                });
                for records in lanes.into_values() {
                    let processor = self.processor.clone();
                    let limiter = self.limiter.clone();
                    drop(tasks.spawn(async move {
                        for record in records {
                            let processor = processor.clone();
                            let limiter = limiter.clone();
                            // a panic fails this record only, the lane moves on
                            let handle = tokio::spawn(async move {
                                let _permit = acquire(limiter).await;
                                process(processor.as_ref(), &record).await;
                            });
                            if let Err(e) = handle.await {
                                task_failed(e);
                            }
                        }
                    }));
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                task_failed(e);
            }
        }
    }
}

async fn acquire(limiter: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match limiter {
        Some(limiter) => limiter.acquire_owned().await.ok(),
        None => None,
    }
}

async fn process(processor: &dyn Processor, record: &Record) {
    if let Err(e) = processor.process_record(record).await {
        error!(
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            "failed to process record: {e:#}"
        );
    }
}

fn task_failed(e: JoinError) {
    let reason = if e.is_panic() { "panic" } else { "cancelled" };
    error!(reason, "record processing task failed: {e}");
    metrics::counter!(PROCESSING_TASKS_FAILED, "reason" => reason).increment(1);
}
