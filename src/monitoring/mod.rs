//! Progress metering, metrics delivery and the final report

pub mod metrics;
pub mod progress;
pub mod report;
pub mod server;

pub use metrics::{MetricsError, MetricsRegistry, MetricsSink, NoopSink, PrometheusSink};
pub use progress::{ProgressMeter, ProgressReader, ProgressSample};
pub use report::ImportReport;
pub use server::MetricsServer;
