use std::sync::Arc;
use std::time::Duration;

use common_kafka::ClientAdapter;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::telemetry::Telemetry;

/// Callback run as the last step of shutdown.
pub type CleanupFn = Box<dyn FnOnce() + Send>;

/// Tears the application down once the shutdown token has been cancelled.
///
/// Steps run strictly in order, each waiting for the previous one:
///
/// 1. wait for the probe server to stop, at most `server_timeout`
/// 2. join the consumer task, which returns after its current batch
/// 3. close the client
/// 4. flush and stop telemetry
/// 5. run cleanup callbacks in registration order
///
/// Failures are logged and never stop the sequence.
pub struct ShutdownCoordinator {
    pub server: JoinHandle<()>,
    pub server_timeout: Duration,
    pub consumer: JoinHandle<()>,
    pub client: Arc<dyn ClientAdapter>,
    pub telemetry: Telemetry,
    pub cleanup: Vec<CleanupFn>,
}

impl ShutdownCoordinator {
    pub async fn run(self) {
        let Self {
            server,
            server_timeout,
            consumer,
            client,
            telemetry,
            cleanup,
        } = self;

        let abort = server.abort_handle();
        match tokio::time::timeout(server_timeout, server).await {
            Ok(Ok(())) => info!("probe server stopped"),
            Ok(Err(e)) => warn!("probe server task failed: {e}"),
            Err(_) => {
                warn!(
                    timeout_ms = server_timeout.as_millis() as u64,
                    "probe server did not stop in time, aborting it"
                );
                abort.abort();
            }
        }

        match consumer.await {
            Ok(()) => info!("consumer stopped"),
            Err(e) => warn!("consumer task failed: {e}"),
        }

        client.close();

        telemetry.shutdown().await;

        for callback in cleanup {
            callback();
        }

        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use common_kafka::test::FakeClient;

    use super::*;

    #[tokio::test]
    async fn steps_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let client = Arc::new(FakeClient::new(vec![]));

        let server = {
            let log = log.clone();
            tokio::spawn(async move { log.lock().unwrap().push("server") })
        };
        let consumer = {
            let log = log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().unwrap().push("consumer");
            })
        };
        let cleanup: Vec<CleanupFn> = ["first", "second"]
            .into_iter()
            .map(|name| {
                let log = log.clone();
                let callback: CleanupFn = Box::new(move || log.lock().unwrap().push(name));
                callback
            })
            .collect();

        ShutdownCoordinator {
            server,
            server_timeout: Duration::from_secs(1),
            consumer,
            client: client.clone(),
            telemetry: Telemetry::disabled(),
            cleanup,
        }
        .run()
        .await;

        assert_eq!(*log.lock().unwrap(), vec!["server", "consumer", "first", "second"]);
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn stuck_server_is_abandoned_after_timeout() {
        let client = Arc::new(FakeClient::new(vec![]));
        let server = tokio::spawn(std::future::pending::<()>());
        let consumer = tokio::spawn(async {});

        tokio::time::timeout(
            Duration::from_secs(5),
            ShutdownCoordinator {
                server,
                server_timeout: Duration::from_millis(50),
                consumer,
                client: client.clone(),
                telemetry: Telemetry::disabled(),
                cleanup: vec![],
            }
            .run(),
        )
        .await
        .expect("shutdown must not wait on a stuck server");

        assert_eq!(client.close_count(), 1);
    }
}
