use crate::error::Result;
use crate::server::{Server, ServerList};
use async_trait::async_trait;
use std::time::Duration;

/// Bytes moved against one server since its counters were last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub downloaded: u64,
    pub uploaded: u64,
}

/// A speed test provider.
///
/// Each measurement step returns its reading instead of storing it on the
/// server descriptor, so a cycle can be assembled from plain values.
#[async_trait]
pub trait MeasurementClient: Send + Sync {
    /// Fetch the provider's server directory in ranking order.
    async fn fetch_servers(&self) -> Result<ServerList>;

    /// Look up a single server by id.
    async fn fetch_server(&self, id: u32) -> Result<Server>;

    /// Round-trip latency to `server`.
    async fn ping(&self, server: &Server) -> Result<Duration>;

    /// Download throughput from `server` in Mbps.
    async fn download(&self, server: &Server) -> Result<f64>;

    /// Upload throughput to `server` in Mbps.
    async fn upload(&self, server: &Server) -> Result<f64>;

    /// Clear the per-server transfer counters, returning what they held.
    fn reset(&self, server: &Server) -> TransferTotals;
}
