use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use common_kafka::kafka_consumer::KafkaClient;
use common_kafka::ClientAdapter;
use health::{probe_routes, ReadinessTracker};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::config::Config;
use crate::consumer::Consumer;
use crate::error::AppError;
use crate::metrics_consts::BATCH_SIZE;
use crate::processor::{InstrumentingProcessor, Processor};
use crate::shutdown::{CleanupFn, ShutdownCoordinator};
use crate::signals::wait_for_shutdown_signal;
use crate::telemetry::Telemetry;

/// A configured consumer application: probe server, poll loop and the
/// shutdown sequence around them.
pub struct App {
    config: Config,
    tracker: ReadinessTracker,
    client: Arc<dyn ClientAdapter>,
    telemetry: Telemetry,
    metrics: Option<PrometheusHandle>,
    cleanup: Vec<CleanupFn>,
}

impl App {
    /// Validates the config, installs the Prometheus recorder and connects
    /// the Kafka client. Expects the tracing subscriber to be installed
    /// already, see [`crate::telemetry::init_tracing`].
    pub fn new(config: Config, telemetry: Telemetry) -> Result<Self, AppError> {
        config.validate()?;

        let metrics = setup_metrics_recorder()?;
        let tracker = ReadinessTracker::new();
        let client = KafkaClient::new(&config.kafka, tracker.clone())?;

        Ok(Self {
            config,
            tracker,
            client: Arc::new(client),
            telemetry,
            metrics: Some(metrics),
            cleanup: vec![],
        })
    }

    /// Builds an app around an existing client. The caller wires rebalance
    /// events into `tracker` itself. No metrics recorder is installed.
    pub fn with_client(
        config: Config,
        client: Arc<dyn ClientAdapter>,
        tracker: ReadinessTracker,
    ) -> Self {
        Self {
            config,
            tracker,
            client,
            telemetry: Telemetry::disabled(),
            metrics: None,
            cleanup: vec![],
        }
    }

    pub fn readiness(&self) -> &ReadinessTracker {
        &self.tracker
    }

    /// Registers a callback for the end of shutdown. Callbacks run in
    /// registration order.
    pub fn with_cleanup<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup.push(Box::new(callback));
        self
    }

    /// `/live`, `/ready` and, when a recorder was installed, `/metrics`.
    pub fn router(&self) -> Router {
        let router = probe_routes(self.tracker.clone());
        match self.metrics.clone() {
            Some(handle) => router.route(
                "/metrics",
                get(move || std::future::ready(handle.render())),
            ),
            None => router,
        }
    }

    /// Runs until SIGINT or SIGTERM, then shuts down.
    pub async fn start<P>(self, processor: P) -> Result<(), AppError>
    where
        P: Processor + 'static,
    {
        let shutdown = CancellationToken::new();
        let signalled = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            signalled.cancel();
        });

        self.run(processor, shutdown).await
    }

    /// Binds the probe server on the configured address, then behaves as
    /// [`App::serve`].
    pub async fn run<P>(self, processor: P, shutdown: CancellationToken) -> Result<(), AppError>
    where
        P: Processor + 'static,
    {
        let address = self.config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| AppError::Bind { address, source })?;

        self.serve(listener, processor, shutdown).await;
        Ok(())
    }

    /// Serves probes on `listener` and consumes with `processor`, wrapped in
    /// an [`InstrumentingProcessor`], until `shutdown` is cancelled. Returns
    /// once the whole shutdown sequence has finished.
    pub async fn serve<P>(self, listener: TcpListener, processor: P, shutdown: CancellationToken)
    where
        P: Processor + 'static,
    {
        if let Ok(address) = listener.local_addr() {
            info!(%address, "probe server listening");
        }

        let router = self.router();
        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
            {
                error!("probe server failed: {e}");
            }
        });

        let processor: Arc<dyn Processor> = Arc::new(InstrumentingProcessor::new(processor));
        let consumer = Consumer::new(
            self.client.clone(),
            processor,
            self.config.dispatch_options(),
        );
        let consumer = tokio::spawn(
            consumer
                .run(shutdown.clone())
                .instrument(info_span!("consumer", app = %self.config.app_name)),
        );

        shutdown.cancelled().await;
        info!("shutting down");

        ShutdownCoordinator {
            server,
            server_timeout: self.config.shutdown_timeout_ms.0,
            consumer,
            client: self.client,
            telemetry: self.telemetry,
            cleanup: self.cleanup,
        }
        .run()
        .await;
    }
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, AppError> {
    // processing durations are recorded in milliseconds
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ];
    const BATCH_BUCKETS: &[f64] = &[1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

    let handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_string()), BATCH_BUCKETS)?
        .install_recorder()?;
    Ok(handle)
}
