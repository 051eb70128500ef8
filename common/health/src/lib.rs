use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::warn;

/// Readiness reporting for a partition consumer.
///
/// A consumer can only usefully receive traffic once the group coordinator
/// has handed it at least one partition. The tracker holds that flag, set by
/// rebalance callbacks, plus any number of named auxiliary checks registered
/// by the embedding application (database reachable, cache warm, ...).
///
/// The readiness probe fails if the flag is down or if any check currently
/// returns an error. The liveness probe only proves the process answers HTTP,
/// and never looks at the tracker state.
///
/// All access goes through one reader/writer lock: probes take the read side,
/// rebalance callbacks and check registration take the write side. Checks run
/// under the read lock, so they must return quickly.
#[derive(Clone, Default)]
pub struct ReadinessTracker {
    state: Arc<RwLock<ReadinessState>>,
}

/// A named readiness check. `Err` means "not ready", with the error as reason.
pub type ReadinessCheck = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct ReadinessState {
    ready: bool,
    checks: BTreeMap<String, ReadinessCheck>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an additional check. Registering twice under the same name
    /// replaces the previous check.
    pub fn add_readiness_check<F>(&self, name: &str, check: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        drop(self.write().checks.insert(name.to_owned(), Box::new(check)));
    }

    /// Overwrites the readiness flag.
    pub fn set_ready(&self, ready: bool) {
        self.write().ready = ready;
    }

    pub fn is_ready(&self) -> bool {
        self.read().ready
    }

    /// Evaluates the flag and every registered check, in name order, and
    /// reports the first failure.
    pub fn readiness(&self) -> ReadinessStatus {
        let state = self.read();

        if !state.ready {
            return ReadinessStatus::NotReady(
                "consumer not ready (no partitions assigned)".to_string(),
            );
        }

        for (name, check) in state.checks.iter() {
            if let Err(err) = check() {
                warn!(check = %name, "readiness check failed: {err:#}");
                return ReadinessStatus::NotReady(format!("{name} is not ready: {err:#}"));
            }
        }

        ReadinessStatus::Ready
    }

    /// Liveness never depends on readiness state: answering is enough.
    pub fn liveness(&self) -> LivenessStatus {
        LivenessStatus
    }

    // A panic while holding the lock cannot leave a bool or a map of boxed
    // closures half-written, so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, ReadinessState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ReadinessState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a readiness probe. Implements [`IntoResponse`] for axum:
/// 200 with `ok`, or 503 with the failure reason as body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessStatus {
    Ready,
    NotReady(String),
}

impl ReadinessStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessStatus::Ready)
    }
}

impl IntoResponse for ReadinessStatus {
    fn into_response(self) -> Response {
        match self {
            ReadinessStatus::Ready => (StatusCode::OK, "ok".to_string()),
            ReadinessStatus::NotReady(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason),
        }
        .into_response()
    }
}

/// Always-healthy liveness status.
pub struct LivenessStatus;

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        (StatusCode::OK, "ok").into_response()
    }
}

/// Router serving `GET /live` and `GET /ready` backed by the given tracker.
pub fn probe_routes(tracker: ReadinessTracker) -> Router {
    let live = tracker.clone();
    Router::new()
        .route("/live", get(move || std::future::ready(live.liveness())))
        .route("/ready", get(move || std::future::ready(tracker.readiness())))
}
