//! Logging setup and the in-process metric types the SMSC reports through
//! its admin API

mod config;
mod exposition;
mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use exposition::Exposition;
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot};
pub use tracing_setup::init_tracing;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("cannot initialise tracing: {0}")]
    TracingInit(String),
}
