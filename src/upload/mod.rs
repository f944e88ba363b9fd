use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ServerConfig;

/// User agent identifying the daemon to the middleware.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// One pulse-count report, created at flush time and never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Middleware UUID of the reporting channel.
    pub uuid: String,

    /// Aggregated pulse count. `None` selects the legacy wire format used
    /// in immediate mode, where a report means exactly one pulse.
    pub count: Option<u64>,

    /// Report creation time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Report {
    /// Aggregated-window report carrying an explicit count.
    pub fn aggregated(uuid: &str, count: u64) -> Self {
        Self {
            uuid: uuid.to_string(),
            count: Some(count),
            timestamp_ms: now_ms(),
        }
    }

    /// Single-pulse report in the legacy format (no query parameters).
    pub fn immediate(uuid: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            count: None,
            timestamp_ms: now_ms(),
        }
    }
}

/// Milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Outcome of one finished delivery.
#[derive(Debug)]
pub struct Completed {
    /// UUID the report was for.
    pub uuid: String,

    /// Delivery result. Success means the request finished with a 2xx
    /// status; the response body is never inspected.
    pub outcome: Result<()>,
}

/// Concurrent, best-effort report delivery.
///
/// `submit` spawns the request and returns immediately, so a slow or
/// failing upload never stalls pulse capture. A failed delivery is logged
/// by the caller and discarded; the next window's snapshot supersedes it.
pub struct Dispatcher {
    http: reqwest::Client,
    base: String,
    in_flight: JoinSet<Completed>,
}

impl Dispatcher {
    /// Create a dispatcher for the configured middleware.
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base: base_url(cfg),
            in_flight: JoinSet::new(),
        })
    }

    /// Number of deliveries currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Enqueue a report for concurrent delivery. Never blocks.
    pub fn submit(&mut self, report: Report) {
        let url = report_url(&self.base, &report);
        let http = self.http.clone();
        let uuid = report.uuid;

        debug!(uuid = %uuid, url = %url, "submitting report");

        self.in_flight.spawn(async move {
            let outcome = deliver(&http, &url).await;
            Completed { uuid, outcome }
        });
    }

    /// Collect one finished delivery without waiting, if any.
    pub fn try_completed(&mut self) -> Option<Completed> {
        loop {
            match self.in_flight.try_join_next() {
                Some(Ok(completed)) => return Some(completed),
                Some(Err(e)) => {
                    warn!(error = %e, "upload task failed");
                }
                None => return None,
            }
        }
    }

    /// Wait for the next finished delivery. Returns `None` once nothing is
    /// in flight.
    pub async fn next_completed(&mut self) -> Option<Completed> {
        loop {
            match self.in_flight.join_next().await {
                Some(Ok(completed)) => return Some(completed),
                Some(Err(e)) => {
                    warn!(error = %e, "upload task failed");
                }
                None => return None,
            }
        }
    }

    /// Abort all in-flight deliveries without waiting for completion.
    pub fn abandon(&mut self) {
        let dropped = self.in_flight.len();
        if dropped > 0 {
            debug!(count = dropped, "abandoning in-flight uploads");
        }
        self.in_flight.abort_all();
    }
}

/// Perform one delivery: empty POST body, response body ignored.
async fn deliver(http: &reqwest::Client, url: &str) -> Result<()> {
    let response = http
        .post(url)
        .body("")
        .send()
        .await
        .with_context(|| format!("posting to {url}"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("unexpected status {status}");
    }

    Ok(())
}

/// Scheme, host, port and trimmed base path, without a trailing slash.
fn base_url(cfg: &ServerConfig) -> String {
    let scheme = if cfg.tls { "https" } else { "http" };
    let path = cfg.path.trim_matches('/');

    format!("{scheme}://{}:{}/{path}", cfg.host, cfg.port)
}

/// Full report URL in the middleware's data endpoint format.
fn report_url(base: &str, report: &Report) -> String {
    match report.count {
        Some(count) => format!(
            "{base}/data/{}.json?ts={}&value={count}",
            report.uuid, report.timestamp_ms
        ),
        None => format!("{base}/data/{}.json", report.uuid),
    }
}
