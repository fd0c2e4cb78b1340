//! speedtest.net measurement client.
//!
//! Talks to the public server directory and to the legacy HTTP endpoints
//! every speedtest.net server exposes next to its `upload.php`:
//! `latency.txt` for round trips and `random<N>x<N>.jpg` for downloads.

use crate::client::{MeasurementClient, TransferTotals};
use crate::error::{MeasurementError, Result};
use crate::server::{Server, ServerList, parse_directory};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_DIRECTORY_URL: &str = "https://www.speedtest.net/api/js/servers";

#[derive(Debug, Clone)]
pub struct SpeedtestConfig {
    pub directory_url: String,
    /// Number of servers requested from the directory.
    pub server_limit: u32,
    pub ping_count: u32,
    /// Wall time spent on each of download and upload.
    pub test_duration: Duration,
    /// Parallel transfer streams per test.
    pub concurrency: usize,
    /// Edge length of the `random<N>x<N>.jpg` download image.
    pub download_size: u32,
    pub upload_chunk_bytes: usize,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            directory_url: DEFAULT_DIRECTORY_URL.to_string(),
            server_limit: 10,
            ping_count: 10,
            test_duration: Duration::from_secs(10),
            concurrency: 4,
            download_size: 2000,
            upload_chunk_bytes: 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

pub struct SpeedtestClient {
    client: Client,
    config: SpeedtestConfig,
    counters: Mutex<HashMap<u32, Arc<Counters>>>,
}

impl SpeedtestClient {
    pub fn new(config: SpeedtestConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("speedtest-exporter/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            counters: Mutex::new(HashMap::new()),
        })
    }

    fn counters_for(&self, server: &Server) -> Arc<Counters> {
        self.counters
            .lock()
            .unwrap()
            .entry(server.id)
            .or_default()
            .clone()
    }

    async fn query_directory(&self, extra: &[(&str, String)]) -> Result<Vec<Server>> {
        let mut query = vec![
            ("engine", "js".to_string()),
            ("https_functional", "true".to_string()),
            ("limit", self.config.server_limit.to_string()),
        ];
        query.extend(extra.iter().map(|(k, v)| (*k, v.clone())));

        tracing::debug!("GET {} {:?}", self.config.directory_url, query);
        let response = self
            .client
            .get(&self.config.directory_url)
            .query(&query)
            .send()
            .await?;
        let entries: Vec<serde_json::Value> = check_status(response)?.json().await?;

        let total = entries.len();
        let servers = parse_directory(entries);
        if servers.len() < total {
            tracing::warn!(
                "Skipped {} unusable directory entries",
                total - servers.len()
            );
        }
        Ok(servers)
    }

    async fn download_stream(&self, url: &str, deadline: Instant, bytes: &AtomicU64) -> Result<()> {
        while Instant::now() < deadline {
            let mut response = check_status(self.client.get(url).send().await?)?;
            while let Some(chunk) = response.chunk().await? {
                bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                if Instant::now() >= deadline {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn upload_stream(
        &self,
        url: &str,
        payload: &[u8],
        deadline: Instant,
        bytes: &AtomicU64,
    ) -> Result<()> {
        while Instant::now() < deadline {
            let response = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(payload.to_vec())
                .send()
                .await?;
            check_status(response)?;
            bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[async_trait]
impl MeasurementClient for SpeedtestClient {
    async fn fetch_servers(&self) -> Result<ServerList> {
        let servers = self.query_directory(&[]).await?;
        tracing::debug!("Directory returned {} servers", servers.len());
        Ok(ServerList::new(servers))
    }

    async fn fetch_server(&self, id: u32) -> Result<Server> {
        self.query_directory(&[("search", id.to_string())])
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or(MeasurementError::ServerNotFound(id))
    }

    async fn ping(&self, server: &Server) -> Result<Duration> {
        let url = server.latency_url()?;
        let mut best: Option<Duration> = None;

        for attempt in 0..self.config.ping_count {
            let start = Instant::now();
            let round_trip = async {
                let response = self
                    .client
                    .get(&url)
                    .query(&[("x", attempt)])
                    .send()
                    .await?;
                check_status(response)?.bytes().await?;
                Ok::<_, MeasurementError>(())
            };
            match round_trip.await {
                Ok(()) => {
                    let rtt = start.elapsed();
                    tracing::trace!("Round trip {} to {}: {:?}", attempt, server.host, rtt);
                    best = Some(best.map_or(rtt, |b| b.min(rtt)));
                }
                Err(e) => tracing::debug!("Round trip {} to {} failed: {}", attempt, server.host, e),
            }
        }

        best.ok_or(MeasurementError::AllProbesFailed(self.config.ping_count))
    }

    async fn download(&self, server: &Server) -> Result<f64> {
        let url = server.download_url(self.config.download_size)?;
        let bytes = AtomicU64::new(0);
        let start = Instant::now();
        let deadline = start + self.config.test_duration;

        let results = join_all(
            (0..self.config.concurrency.max(1)).map(|_| self.download_stream(&url, deadline, &bytes)),
        )
        .await;
        let elapsed = start.elapsed();
        let total = bytes.into_inner();

        self.counters_for(server)
            .downloaded
            .fetch_add(total, Ordering::Relaxed);
        settle(results, total)?;
        tracing::debug!("Downloaded {} bytes from {} in {:?}", total, server.host, elapsed);
        Ok(mbps(total, elapsed))
    }

    async fn upload(&self, server: &Server) -> Result<f64> {
        server.base_url()?;
        let payload = upload_payload(self.config.upload_chunk_bytes);
        let bytes = AtomicU64::new(0);
        let start = Instant::now();
        let deadline = start + self.config.test_duration;

        let results = join_all((0..self.config.concurrency.max(1)).map(|_| {
            self.upload_stream(&server.url, &payload, deadline, &bytes)
        }))
        .await;
        let elapsed = start.elapsed();
        let total = bytes.into_inner();

        self.counters_for(server)
            .uploaded
            .fetch_add(total, Ordering::Relaxed);
        settle(results, total)?;
        tracing::debug!("Uploaded {} bytes to {} in {:?}", total, server.host, elapsed);
        Ok(mbps(total, elapsed))
    }

    fn reset(&self, server: &Server) -> TransferTotals {
        match self.counters.lock().unwrap().remove(&server.id) {
            Some(c) => TransferTotals {
                downloaded: c.downloaded.load(Ordering::Relaxed),
                uploaded: c.uploaded.load(Ordering::Relaxed),
            },
            None => TransferTotals::default(),
        }
    }
}

fn check_status(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(MeasurementError::Status {
            status: response.status(),
            url: response.url().to_string(),
        })
    }
}

/// A test that moved no data surfaces the first stream error; partial
/// transfers still count.
fn settle(results: Vec<Result<()>>, total: u64) -> Result<()> {
    let mut errors = results.into_iter().filter_map(|r| r.err());
    match errors.next() {
        Some(e) if total == 0 => Err(e),
        Some(e) => {
            tracing::debug!("Transfer stream ended early: {}", e);
            Ok(())
        }
        None => Ok(()),
    }
}

pub(crate) fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs / 1_000_000.0
    } else {
        0.0
    }
}

/// Form-encoded body of the requested size, as `upload.php` expects.
fn upload_payload(size: usize) -> Vec<u8> {
    const PREFIX: &[u8] = b"content1=";
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let mut payload = Vec::with_capacity(size.max(PREFIX.len()));
    payload.extend_from_slice(PREFIX);
    payload.extend(ALPHABET.iter().cycle().take(size.saturating_sub(PREFIX.len())));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::Query,
        http::StatusCode,
        routing::{get, post},
    };
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn spawn_fake_provider() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host = addr.to_string();

        let directory_host = host.clone();
        let app = Router::new()
            .route(
                "/api/js/servers",
                get(move |Query(q): Query<HashMap<String, String>>| {
                    let host = directory_host.clone();
                    async move {
                        let all = vec![
                            serde_json::json!({
                                "id": "2", "host": host, "distance": 40,
                                "url": format!("http://{}/speedtest/upload.php", host),
                                "name": "Far", "country": "X", "sponsor": "B",
                            }),
                            serde_json::json!({
                                "id": "1", "host": host, "distance": 5,
                                "url": format!("http://{}/speedtest/upload.php", host),
                                "name": "Near", "country": "X", "sponsor": "A",
                            }),
                        ];
                        let selected: Vec<_> = match q.get("search") {
                            Some(id) => all.into_iter().filter(|s| s["id"] == *id).collect(),
                            None => all,
                        };
                        axum::Json(selected)
                    }
                }),
            )
            .route("/speedtest/latency.txt", get(|| async { "test=test\n" }))
            .route(
                "/speedtest/{file}",
                get(|| async { vec![0u8; 64 * 1024] }),
            )
            .route("/speedtest/upload.php", post(|body: String| async move {
                format!("size={}", body.len())
            }))
            .route("/broken/latency.txt", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        host
    }

    fn client_for(host: &str) -> SpeedtestClient {
        SpeedtestClient::new(SpeedtestConfig {
            directory_url: format!("http://{}/api/js/servers", host),
            ping_count: 3,
            test_duration: Duration::from_millis(200),
            concurrency: 2,
            upload_chunk_bytes: 16 * 1024,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn mbps_conversion() {
        assert_eq!(mbps(1_250_000, Duration::from_secs(1)), 10.0);
        assert_eq!(mbps(1_250_000, Duration::from_secs(2)), 5.0);
        assert_eq!(mbps(42, Duration::ZERO), 0.0);
    }

    #[test]
    fn upload_payload_is_form_encoded() {
        let payload = upload_payload(32);
        assert_eq!(payload.len(), 32);
        assert!(payload.starts_with(b"content1="));
        assert!(payload[9..].iter().all(u8::is_ascii_alphanumeric));
    }

    #[tokio::test]
    async fn fetches_and_ranks_directory() {
        let host = spawn_fake_provider().await;
        let client = client_for(&host);

        let list = client.fetch_servers().await.unwrap();
        assert_eq!(list.len(), 2);
        let first = list.find_servers(&[]).unwrap()[0];
        assert_eq!(first.id, 1);
        assert_eq!(first.name, "Near");
    }

    #[tokio::test]
    async fn fetches_server_by_id() {
        let host = spawn_fake_provider().await;
        let client = client_for(&host);

        let server = client.fetch_server(2).await.unwrap();
        assert_eq!(server.name, "Far");

        assert!(matches!(
            client.fetch_server(99).await,
            Err(MeasurementError::ServerNotFound(99))
        ));
    }

    #[tokio::test]
    async fn directory_unreachable_is_an_error() {
        let client = client_for("127.0.0.1:1");
        assert!(matches!(
            client.fetch_servers().await,
            Err(MeasurementError::Http(_))
        ));
    }

    #[tokio::test]
    async fn measures_against_server() {
        let host = spawn_fake_provider().await;
        let client = client_for(&host);
        let server = client.fetch_server(1).await.unwrap();

        let latency = client.ping(&server).await.unwrap();
        assert!(latency < Duration::from_secs(5));

        let down = client.download(&server).await.unwrap();
        assert!(down > 0.0);
        let up = client.upload(&server).await.unwrap();
        assert!(up > 0.0);

        let totals = client.reset(&server);
        assert!(totals.downloaded > 0);
        assert!(totals.uploaded >= 16 * 1024);
        assert_eq!(client.reset(&server), TransferTotals::default());
    }

    #[tokio::test]
    async fn ping_fails_when_every_round_trip_fails() {
        let host = spawn_fake_provider().await;
        let client = client_for(&host);
        let mut server = client.fetch_server(1).await.unwrap();
        server.url = format!("http://{}/broken/upload.php", host);

        assert!(matches!(
            client.ping(&server).await,
            Err(MeasurementError::AllProbesFailed(3))
        ));
    }
}
