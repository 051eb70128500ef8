use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::record::Record;

/// The narrow surface the poll loop needs from a messaging client.
///
/// The production implementation is [`crate::kafka_consumer::KafkaClient`];
/// tests substitute [`crate::test::FakeClient`].
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// Waits for the next batch. Returns early, possibly with an empty
    /// batch, once `shutdown` is cancelled. Transport problems are reported
    /// inside the returned [`Fetch`], never as a failure of the call.
    async fn poll(&self, shutdown: &CancellationToken) -> Fetch;

    /// Releases the underlying connection. Safe to call more than once.
    fn close(&self);
}

/// One poll's worth of records and the errors reported alongside them.
#[derive(Debug, Default)]
pub struct Fetch {
    records: Vec<Record>,
    errors: Vec<FetchError>,
}

impl Fetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_size_hint(hint: usize) -> Self {
        Self {
            records: Vec::with_capacity(hint),
            errors: vec![],
        }
    }

    pub fn push_record(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn push_error(&mut self, error: FetchError) {
        self.errors.push(error);
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FetchError] {
        &self.errors
    }

    /// Hands every record to `f`, in the order the client delivered them.
    pub fn each_record<F>(self, f: F)
    where
        F: FnMut(Record),
    {
        self.records.into_iter().for_each(f);
    }

    // consume this Fetch and return its contents
    pub fn unpack(self) -> (Vec<Record>, Vec<FetchError>) {
        (self.records, self.errors)
    }
}

/// An error the client reported for a topic, and for a partition when the
/// client knows which one.
#[derive(Debug)]
pub struct FetchError {
    pub topic: String,
    pub partition: Option<i32>,
    pub error: anyhow::Error,
}

impl FetchError {
    pub fn new(topic: &str, partition: Option<i32>, error: anyhow::Error) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            error,
        }
    }
}
