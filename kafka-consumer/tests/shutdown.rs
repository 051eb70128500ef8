use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common_kafka::test::FakeClient;
use common_kafka::{Fetch, Record};
use envconfig::Envconfig;
use health::ReadinessTracker;
use kafka_consumer::config::Config;
use kafka_consumer::{App, Processor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> Config {
    let env = HashMap::from([
        ("KAFKA_CONSUMER_TOPIC".to_string(), "payments".to_string()),
        ("SHUTDOWN_TIMEOUT_MS".to_string(), "1000".to_string()),
    ]);
    Config::init_from_hashmap(&env).expect("failed to load config")
}

fn one_record_batch() -> Fetch {
    let mut fetch = Fetch::new();
    fetch.push_record(Record::new("payments", 0, 0).with_value("{}"));
    fetch
}

#[derive(Default)]
struct SlowProcessor {
    started: Notify,
    finished_at: Mutex<Option<Instant>>,
}

#[async_trait]
impl Processor for SlowProcessor {
    async fn process_record(&self, _record: &Record) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(150)).await;
        *self.finished_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }
}

async fn http_get(address: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(address).await.expect("failed to connect");
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .expect("failed to send request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("failed to read response");
    response
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_closes_after_in_flight_records_finish() {
    let client = Arc::new(FakeClient::new(vec![one_record_batch()]));
    let processor = Arc::new(SlowProcessor::default());
    let cleanup_log = Arc::new(Mutex::new(Vec::<(&'static str, usize)>::new()));

    let app = {
        let (first, second) = (cleanup_log.clone(), cleanup_log.clone());
        let (client_a, client_b) = (client.clone(), client.clone());
        App::with_client(config(), client.clone(), ReadinessTracker::new())
            .with_cleanup(move || first.lock().unwrap().push(("first", client_a.close_count())))
            .with_cleanup(move || second.lock().unwrap().push(("second", client_b.close_count())))
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(app.serve(listener, processor.clone(), shutdown.clone()));

    tokio::time::timeout(WAIT, processor.started.notified())
        .await
        .expect("record was never dispatched");
    shutdown.cancel();

    tokio::time::timeout(WAIT, running)
        .await
        .expect("shutdown did not complete")
        .expect("app task panicked");

    let finished_at = processor
        .finished_at
        .lock()
        .unwrap()
        .expect("in-flight record was abandoned");
    let closed_at = client.closed_at().expect("client was never closed");
    assert!(closed_at >= finished_at);
    assert_eq!(client.close_count(), 1);
    assert_eq!(client.poll_count(), 1);

    // cleanup runs last, in registration order
    assert_eq!(*cleanup_log.lock().unwrap(), vec![("first", 1), ("second", 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn probes_are_served_until_shutdown() {
    let client = Arc::new(FakeClient::new(vec![]));
    let tracker = ReadinessTracker::new();
    let app = App::with_client(config(), client.clone(), tracker.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn(app.serve(
        listener,
        Arc::new(SlowProcessor::default()),
        shutdown.clone(),
    ));

    let live = http_get(address, "/live").await;
    assert!(live.starts_with("HTTP/1.1 200"), "{live}");
    assert!(live.ends_with("ok"));

    let ready = http_get(address, "/ready").await;
    assert!(ready.starts_with("HTTP/1.1 503"), "{ready}");
    assert!(ready.contains("no partitions assigned"));

    tracker.set_ready(true);
    let ready = http_get(address, "/ready").await;
    assert!(ready.starts_with("HTTP/1.1 200"), "{ready}");

    shutdown.cancel();
    tokio::time::timeout(WAIT, running)
        .await
        .expect("shutdown did not complete")
        .expect("app task panicked");
    assert_eq!(client.close_count(), 1);
    assert!(TcpStream::connect(address).await.is_err());
}

#[tokio::test]
async fn router_without_recorder_has_no_metrics_route() {
    let app = App::with_client(
        config(),
        Arc::new(FakeClient::new(vec![])),
        ReadinessTracker::new(),
    );
    app.readiness().set_ready(true);

    let ready = app
        .router()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let metrics = app
        .router()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(metrics.status(), StatusCode::NOT_FOUND);
}
