// ==== Record processing ====
/// Counter for processed records, labelled by `topic` and `success`
pub const MESSAGES_PROCESSED: &str = "kafka_messages_processed_total";

/// Histogram for per-record processing time in milliseconds, same labels
pub const MESSAGE_PROCESSING_DURATION_MS: &str = "kafka_message_processing_duration_ms";

/// Counter for processing tasks that did not complete normally, labelled by `reason`
pub const PROCESSING_TASKS_FAILED: &str = "kafka_consumer_processing_tasks_failed_total";

// ==== Poll loop ====
/// Counter for errors reported by a poll, labelled by `topic` and `partition`
pub const FETCH_ERRORS: &str = "kafka_consumer_fetch_errors_total";

/// Histogram for the number of records in each dispatched batch
pub const BATCH_SIZE: &str = "kafka_consumer_batch_size";
