use crate::collector::ProcessMetrics;
use crate::runner::MeasurementRunner;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct ScrapeState {
    runner: Arc<MeasurementRunner>,
    registry: Arc<Registry>,
    process: Arc<ProcessMetrics>,
}

/// Serves `/metrics`, running a speed test before every render.
pub struct MetricsServer {
    state: ScrapeState,
    port: u16,
    cancel: CancellationToken,
}

impl MetricsServer {
    pub fn new(
        runner: Arc<MeasurementRunner>,
        registry: Arc<Registry>,
        process: Arc<ProcessMetrics>,
        port: u16,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: ScrapeState {
                runner,
                registry,
                process,
            },
            port,
            cancel,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(scrape_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = listener.local_addr()?;
        tracing::info!("Metrics server listening on http://{}/metrics", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await?;

        tracing::info!("Metrics server stopped");
        Ok(())
    }
}

async fn scrape_handler(State(state): State<ScrapeState>) -> Response {
    if let Err(e) = state.runner.run().await {
        tracing::debug!("Serving previous values: {}", e);
    }
    state.process.refresh();

    let mut buffer = String::new();
    let encoded = {
        let _guard = state.runner.metrics().read();
        encode(&mut buffer, &state.registry)
    };

    match encoded {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE)],
            buffer,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
