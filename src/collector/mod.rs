pub mod metrics;
pub mod process;
pub mod server;

pub use metrics::{LatencyLabels, Outcome, SpeedMetrics};
pub use process::ProcessMetrics;
pub use server::MetricsServer;
