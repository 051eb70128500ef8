use std::collections::BTreeMap;

use health::ReadinessTracker;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::metrics_consts::REBALANCE_EVENTS;

/// Partitions per topic, as carried by a rebalance callback.
pub type PartitionMap = BTreeMap<String, Vec<i32>>;

pub fn partition_map(partitions: &TopicPartitionList) -> PartitionMap {
    let mut map = PartitionMap::new();
    for elem in partitions.elements() {
        map.entry(elem.topic().to_owned())
            .or_default()
            .push(elem.partition());
    }
    map
}

/// A group membership change, reduced to what readiness cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(PartitionMap),
    Revoked(PartitionMap),
    /// Partitions taken away without a clean revoke, e.g. after a session timeout.
    Lost(PartitionMap),
}

impl RebalanceEvent {
    /// Updates readiness for this event.
    ///
    /// Any non-empty revocation or loss marks the consumer not ready. An
    /// empty revocation does not: it leaves the tracker untouched, and so
    /// does an empty assignment. Cooperative-sticky emits both on every
    /// group change and they move no partitions.
    pub fn apply(&self, tracker: &ReadinessTracker) {
        match self {
            RebalanceEvent::Assigned(partitions) if partitions.is_empty() => {
                debug!("skipping empty partition assignment");
                metrics::counter!(REBALANCE_EVENTS, "event" => "empty_assign").increment(1);
            }
            RebalanceEvent::Revoked(partitions) if partitions.is_empty() => {
                debug!("skipping empty partition revocation");
                metrics::counter!(REBALANCE_EVENTS, "event" => "empty_revoke").increment(1);
            }
            RebalanceEvent::Assigned(partitions) => {
                tracker.set_ready(true);
                info!(?partitions, "partitions assigned");
                metrics::counter!(REBALANCE_EVENTS, "event" => "assigned").increment(1);
            }
            RebalanceEvent::Revoked(partitions) => {
                tracker.set_ready(false);
                info!(?partitions, "partitions revoked");
                metrics::counter!(REBALANCE_EVENTS, "event" => "revoked").increment(1);
            }
            RebalanceEvent::Lost(partitions) => {
                tracker.set_ready(false);
                warn!(?partitions, "partitions lost");
                metrics::counter!(REBALANCE_EVENTS, "event" => "lost").increment(1);
            }
        }
    }
}

/// rdkafka consumer context that feeds group rebalances into a
/// [`ReadinessTracker`].
pub struct ReadinessContext {
    tracker: ReadinessTracker,
}

impl ReadinessContext {
    pub fn new(tracker: ReadinessTracker) -> Self {
        Self { tracker }
    }
}

impl ClientContext for ReadinessContext {}

impl ConsumerContext for ReadinessContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let partitions = partition_map(partitions);
                let event = if base_consumer.assignment_lost() {
                    RebalanceEvent::Lost(partitions)
                } else {
                    RebalanceEvent::Revoked(partitions)
                };
                event.apply(&self.tracker);
            }
            Rebalance::Assign(partitions) => {
                debug!(count = partitions.count(), "pre-rebalance assign");
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
                metrics::counter!(REBALANCE_EVENTS, "event" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            RebalanceEvent::Assigned(partition_map(partitions)).apply(&self.tracker);
        }
    }
}
