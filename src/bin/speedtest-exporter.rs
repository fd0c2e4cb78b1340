use clap::Parser;
use prometheus_client::registry::Registry;
use speedtest_exporter::{
    MeasurementRunner, ServerSelection, SpeedtestClient, SpeedtestConfig,
    collector::{MetricsServer, ProcessMetrics, SpeedMetrics},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "speedtest-exporter")]
#[command(about = "Run an internet speed test on every Prometheus scrape")]
struct Args {
    /// Port for /metrics endpoint
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Always test against this speedtest.net server id instead of the nearest one
    #[arg(long)]
    server_id: Option<u32>,

    /// Latency round trips per cycle
    #[arg(long, default_value_t = 10)]
    ping_count: u32,

    /// Seconds spent on each of the download and upload tests (minimum 1)
    #[arg(long, default_value_t = 10)]
    test_duration: u64,

    /// Parallel transfer streams per test
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Per-request HTTP timeout in seconds
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Server directory URL
    #[arg(long, default_value = speedtest_exporter::speedtest::DEFAULT_DIRECTORY_URL)]
    directory_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let cancel = CancellationToken::new();

    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal");
        cancel_signal.cancel();
    });

    let config = SpeedtestConfig {
        directory_url: args.directory_url,
        ping_count: args.ping_count.max(1),
        test_duration: Duration::from_secs(args.test_duration.max(1)),
        concurrency: args.concurrency.max(1),
        request_timeout: Duration::from_secs(args.request_timeout.max(1)),
        ..Default::default()
    };
    let client = Arc::new(SpeedtestClient::new(config)?);

    let selection = match args.server_id {
        Some(id) => {
            tracing::info!("Testing against fixed server {}", id);
            ServerSelection::Fixed(id)
        }
        None => {
            tracing::info!("Testing against the nearest server");
            ServerSelection::Discover
        }
    };

    let metrics = Arc::new(SpeedMetrics::new(selection.latency_labels()));
    let process = Arc::new(ProcessMetrics::new());
    let mut registry = Registry::default();
    metrics.register(&mut registry);
    process.register(&mut registry);
    let registry = Arc::new(registry);

    let runner = Arc::new(MeasurementRunner::new(client, selection, metrics));

    let server = MetricsServer::new(runner, registry, process, args.port, cancel.clone());
    server.run().await.map_err(|e| {
        tracing::error!("Metrics server error: {}", e);
        e as Box<dyn std::error::Error>
    })?;

    tracing::info!("Shutdown complete");
    Ok(())
}
