pub mod client;
pub mod collector;
pub mod error;
pub mod runner;
pub mod server;
pub mod speedtest;

pub use client::{MeasurementClient, TransferTotals};
pub use error::{MeasurementError, Result};
pub use runner::{MeasurementResult, MeasurementRunner, ServerSelection};
pub use server::{Server, ServerList};
pub use speedtest::{SpeedtestClient, SpeedtestConfig};
