use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use s0d::channel::Registry;
use s0d::config::{ChannelConfig, Config, ServerConfig};
use s0d::counter::PulseCounters;
use s0d::engine::Engine;
use s0d::gpio::EdgeEvent;

/// Maps a request line to a response status; `None` stalls the connection
/// without ever answering.
type Responder = Arc<dyn Fn(&str) -> Option<u16> + Send + Sync>;

fn ok_responder() -> Responder {
    Arc::new(|_: &str| Some(200))
}

/// Minimal in-process HTTP endpoint standing in for the middleware.
/// Records the request line of every answered request.
async fn spawn_server(responder: Responder) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            let responder = Arc::clone(&responder);

            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let first_line = request.lines().next().unwrap_or_default().to_string();

                let Some(status) = responder(&first_line) else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    return;
                };

                let _ = tx.send(first_line);

                let reason = if status == 200 {
                    "OK"
                } else {
                    "Internal Server Error"
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = sock.write_all(response.as_bytes()).await;
            });
        }
    });

    (port, rx)
}

fn test_config(port: u16, interval: Duration, channels: &[(u32, Option<&str>)]) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            path: "middleware.php".to_string(),
            tls: false,
            timeout: Duration::from_secs(2),
        },
        aggregate_interval: interval,
        channels: channels
            .iter()
            .map(|&(gpio, uuid)| ChannelConfig {
                gpio,
                uuid: uuid.map(String::from),
            })
            .collect(),
        ..Config::default()
    }
}

struct RunningEngine {
    edges: mpsc::Sender<EdgeEvent>,
    cancel: CancellationToken,
    counters: Arc<PulseCounters>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn start_engine(cfg: &Config) -> RunningEngine {
    let registry = Registry::from_config(cfg);
    let (edge_tx, edge_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let engine = Engine::new(cfg, registry, edge_rx, cancel.clone()).expect("engine");
    let counters = engine.counters();
    let handle = tokio::spawn(engine.run());

    RunningEngine {
        edges: edge_tx,
        cancel,
        counters,
        handle,
    }
}

impl RunningEngine {
    async fn pulse(&self, index: usize, times: usize) {
        for _ in 0..times {
            self.edges
                .send(EdgeEvent { index })
                .await
                .expect("engine should be running");
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), self.handle)
            .await
            .expect("engine should stop on cancel")
            .expect("engine task")
            .expect("engine run");
    }
}

/// Drain recorded requests until nothing arrives for `quiet`.
async fn collect_requests(rx: &mut mpsc::UnboundedReceiver<String>, quiet: Duration) -> Vec<String> {
    let mut requests = Vec::new();

    while let Ok(Some(line)) = tokio::time::timeout(quiet, rx.recv()).await {
        requests.push(line);
    }

    requests
}

#[tokio::test]
async fn test_aggregated_flush_reports_only_nonzero_mapped_channels() {
    let (port, mut requests) = spawn_server(ok_responder()).await;
    let cfg = test_config(
        port,
        Duration::from_millis(150),
        &[(17, Some("uuid-a")), (18, Some("uuid-b")), (21, None)],
    );

    let engine = start_engine(&cfg);

    // Three pulses on channel 0, none on channel 1, two on the unmapped
    // channel 2, all inside the first window.
    engine.pulse(0, 3).await;
    engine.pulse(2, 2).await;

    let seen = collect_requests(&mut requests, Duration::from_millis(500)).await;

    assert_eq!(seen.len(), 1, "exactly one report expected, got {seen:?}");
    assert!(seen[0].contains("/middleware.php/data/uuid-a.json?ts="));
    assert!(seen[0].contains("&value=3"));
    assert!(seen[0].starts_with("POST "));

    engine.stop().await;
}

#[tokio::test]
async fn test_unmapped_channel_counts_but_never_uploads() {
    let (port, mut requests) = spawn_server(ok_responder()).await;

    // Long window so no flush happens during the test.
    let cfg = test_config(port, Duration::from_secs(600), &[(17, None)]);

    let engine = start_engine(&cfg);
    engine.pulse(0, 2).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.counters.get(0), 2);

    let seen = collect_requests(&mut requests, Duration::from_millis(200)).await;
    assert!(seen.is_empty(), "unexpected uploads: {seen:?}");

    engine.stop().await;
}

#[tokio::test]
async fn test_immediate_mode_reports_each_pulse() {
    let (port, mut requests) = spawn_server(ok_responder()).await;
    let cfg = test_config(
        port,
        Duration::ZERO,
        &[(17, Some("uuid-a")), (18, None)],
    );

    let engine = start_engine(&cfg);

    engine.pulse(0, 2).await;
    engine.pulse(1, 1).await;

    let seen = collect_requests(&mut requests, Duration::from_millis(500)).await;

    assert_eq!(seen.len(), 2, "one report per pulse expected, got {seen:?}");
    for line in &seen {
        // Legacy format: bare data endpoint, no query parameters.
        assert!(line.contains("/middleware.php/data/uuid-a.json"));
        assert!(!line.contains('?'), "legacy report carries no query: {line}");
    }

    engine.stop().await;
}

#[tokio::test]
async fn test_upload_failure_is_isolated_per_channel() {
    let responder: Responder =
        Arc::new(|line: &str| Some(if line.contains("uuid-a") { 500 } else { 200 }));
    let (port, mut requests) = spawn_server(responder).await;

    let cfg = test_config(
        port,
        Duration::from_millis(150),
        &[(17, Some("uuid-a")), (18, Some("uuid-b"))],
    );

    let engine = start_engine(&cfg);

    // First window: both channels pulse; uuid-a's upload fails with 500.
    engine.pulse(0, 1).await;
    engine.pulse(1, 1).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Second window: counting continues unaffected by the earlier failure.
    engine.pulse(1, 4).await;

    let seen = collect_requests(&mut requests, Duration::from_millis(500)).await;

    let for_a: Vec<&String> = seen.iter().filter(|l| l.contains("uuid-a")).collect();
    let for_b: Vec<&String> = seen.iter().filter(|l| l.contains("uuid-b")).collect();

    assert_eq!(for_a.len(), 1, "failed report is not retried: {seen:?}");
    assert_eq!(for_b.len(), 2, "other channel unaffected: {seen:?}");
    assert!(for_b[1].contains("&value=4"));

    engine.stop().await;
}

#[tokio::test]
async fn test_shutdown_abandons_inflight_uploads() {
    // Server that never answers, so every delivery hangs until its timeout.
    let responder: Responder = Arc::new(|_: &str| None);
    let (port, _requests) = spawn_server(responder).await;

    let cfg = test_config(port, Duration::ZERO, &[(17, Some("uuid-a"))]);

    let engine = start_engine(&cfg);
    engine.pulse(0, 1).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Cancellation must not wait for the stalled delivery.
    engine.stop().await;
}
