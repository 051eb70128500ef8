/// Counter for rebalance callbacks, labelled by `event` (assigned, revoked,
/// lost, empty_assign, empty_revoke, error)
pub const REBALANCE_EVENTS: &str = "kafka_consumer_rebalance_events_total";
