//! # Courier Telemetry
//!
//! Logging and metrics setup shared by Courier binaries.
//!
//! ## Components
//!
//! - **Logs:** `tracing-subscriber` with an `EnvFilter`, plain or JSON output
//! - **Metrics:** a Prometheus registry with message, RPC and reply counters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let telemetry = init_telemetry(TelemetryConfig::from_env())?;
//!     telemetry.metrics().message_sent("task");
//!     println!("{}", telemetry.metrics().gather_text()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `COURIER_SERVICE_NAME` | `courier` | Service name attached to startup logs |
//! | `COURIER_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `COURIER_JSON_LOGS` | `false` | JSON formatted logs |
//! | `COURIER_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{BusMetrics, HistogramTimer, ReplyCounts};
pub use tracing_setup::{build_filter, init_tracing};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    let metrics = BusMetrics::new()?;
    init_tracing(&config)?;

    Ok(Telemetry { config, metrics })
}

/// Handle returned by [`init_telemetry`].
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: BusMetrics,
}

impl Telemetry {
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}

/// Increment a labelled counter on a [`BusMetrics`].
///
/// ```rust,ignore
/// metric_inc!(metrics.messages_sent, "event");
/// ```
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr) => {
        $metric.inc()
    };
    ($metric:expr, $label:expr) => {
        $metric.with_label_values(&[$label]).inc()
    };
}
