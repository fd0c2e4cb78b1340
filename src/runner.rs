use crate::client::MeasurementClient;
use crate::collector::metrics::{LatencyLabels, SpeedMetrics};
use crate::error::Result;
use crate::server::Server;
use std::sync::Arc;
use std::time::Duration;

/// How the target server is chosen each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSelection {
    /// Nearest server from the provider directory.
    Discover,
    /// A fixed server id; the cycle fails if it stops resolving.
    Fixed(u32),
}

impl ServerSelection {
    pub fn latency_labels(self) -> LatencyLabels {
        match self {
            ServerSelection::Discover => LatencyLabels::PerHost,
            ServerSelection::Fixed(_) => LatencyLabels::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency: Duration,
    pub host: String,
}

impl MeasurementResult {
    /// Whole milliseconds, truncated.
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_millis() as f64
    }
}

/// Runs one speed test cycle and publishes it to [`SpeedMetrics`].
pub struct MeasurementRunner {
    client: Arc<dyn MeasurementClient>,
    selection: ServerSelection,
    metrics: Arc<SpeedMetrics>,
}

impl MeasurementRunner {
    pub fn new(
        client: Arc<dyn MeasurementClient>,
        selection: ServerSelection,
        metrics: Arc<SpeedMetrics>,
    ) -> Self {
        Self {
            client,
            selection,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<SpeedMetrics> {
        &self.metrics
    }

    /// Server lookup failures abort the cycle with the gauges untouched.
    /// Failures of the individual tests are logged and read as zero.
    pub async fn run(&self) -> Result<MeasurementResult> {
        let server = match self.select_server().await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!("Speed test aborted: {}", e);
                self.metrics.record_failure();
                return Err(e);
            }
        };
        tracing::info!("Testing against {}", server);

        let latency = self.client.ping(&server).await.unwrap_or_else(|e| {
            tracing::warn!("Latency check against {} failed: {}", server.host, e);
            Duration::ZERO
        });
        let download_mbps = self.client.download(&server).await.unwrap_or_else(|e| {
            tracing::warn!("Download test from {} failed: {}", server.host, e);
            0.0
        });
        let upload_mbps = self.client.upload(&server).await.unwrap_or_else(|e| {
            tracing::warn!("Upload test to {} failed: {}", server.host, e);
            0.0
        });

        let result = MeasurementResult {
            download_mbps,
            upload_mbps,
            latency,
            host: server.host.clone(),
        };
        self.metrics.record(&result);

        let totals = self.client.reset(&server);
        tracing::debug!(
            "Moved {} bytes down, {} bytes up with {}",
            totals.downloaded,
            totals.uploaded,
            server.host
        );
        tracing::info!(
            "Download {:.2} Mbps, upload {:.2} Mbps, latency {} ms ({})",
            result.download_mbps,
            result.upload_mbps,
            result.latency_ms(),
            result.host
        );

        Ok(result)
    }

    async fn select_server(&self) -> Result<Server> {
        match self.selection {
            ServerSelection::Discover => {
                let servers = self.client.fetch_servers().await?;
                tracing::debug!("Fetched {} servers", servers.len());
                let candidates = servers.find_servers(&[])?;
                Ok(candidates[0].clone())
            }
            ServerSelection::Fixed(id) => self.client.fetch_server(id).await,
        }
    }
}
