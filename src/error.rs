use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeasurementError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected HTTP status {status} from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
    #[error("No servers available")]
    NoServers,
    #[error("Server {0} not found")]
    ServerNotFound(u32),
    #[error("All {0} latency round trips failed")]
    AllProbesFailed(u32),
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, MeasurementError>;
