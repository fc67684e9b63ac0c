//! Prometheus-backed progress gauges
//!
//! Gauges are registered through an explicit [`MetricsRegistry`] rather than
//! a process-global default. Asking for a gauge that is already registered
//! hands back the existing collector.

use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub const REGISTRY_PROGRESS_NAME: &str = "registry_progress";
const REGISTRY_PROGRESS_HELP: &str = "The registry import progress in percentage";
pub const REGISTRY_AVG_SPEED_NAME: &str = "registry_average_speed";
const REGISTRY_AVG_SPEED_HELP: &str = "The average registry import speed in bytes/sec";
pub const REGISTRY_CUR_SPEED_NAME: &str = "registry_current_speed";
const REGISTRY_CUR_SPEED_HELP: &str = "The current registry import speed in bytes/sec";
const OWNER_LABEL: &str = "ownerUID";

/// Failure to deliver a sample to the metrics backend; never fatal to an import
#[derive(Debug, Error)]
#[error("metrics delivery failed: {0}")]
pub struct MetricsError(String);

impl From<prometheus::Error> for MetricsError {
    fn from(err: prometheus::Error) -> Self {
        MetricsError(err.to_string())
    }
}

/// Destination of progress samples
pub trait MetricsSink: Send + Sync {
    fn set_progress(&self, percent: f64) -> Result<(), MetricsError>;
    fn set_average_speed(&self, bytes_per_sec: f64) -> Result<(), MetricsError>;
    fn set_current_speed(&self, bytes_per_sec: f64) -> Result<(), MetricsError>;
}

/// Sink that discards every sample
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn set_progress(&self, _percent: f64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn set_average_speed(&self, _bytes_per_sec: f64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn set_current_speed(&self, _bytes_per_sec: f64) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Explicit, idempotent registration of gauge vectors
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    registry: Registry,
    gauges: Arc<Mutex<HashMap<String, GaugeVec>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the gauge vector registered under `name`, registering it on first use
    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec, MetricsError> {
        let mut gauges = self.gauges.lock();
        if let Some(existing) = gauges.get(name) {
            return Ok(existing.clone());
        }

        let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
        self.registry.register(Box::new(gauge.clone()))?;
        gauges.insert(name.to_string(), gauge.clone());
        Ok(gauge)
    }

    /// Render all registered metrics in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError(e.to_string()))
    }
}

/// Progress gauges for one owner, backed by a [`MetricsRegistry`]
pub struct PrometheusSink {
    progress: GaugeVec,
    average_speed: GaugeVec,
    current_speed: GaugeVec,
    owner_uid: String,
}

impl PrometheusSink {
    pub fn new(registry: &MetricsRegistry, owner_uid: impl Into<String>) -> Result<Self, MetricsError> {
        Ok(Self {
            progress: registry.gauge_vec(REGISTRY_PROGRESS_NAME, REGISTRY_PROGRESS_HELP, &[OWNER_LABEL])?,
            average_speed: registry.gauge_vec(REGISTRY_AVG_SPEED_NAME, REGISTRY_AVG_SPEED_HELP, &[OWNER_LABEL])?,
            current_speed: registry.gauge_vec(REGISTRY_CUR_SPEED_NAME, REGISTRY_CUR_SPEED_HELP, &[OWNER_LABEL])?,
            owner_uid: owner_uid.into(),
        })
    }

    fn set(&self, gauge: &GaugeVec, value: f64) -> Result<(), MetricsError> {
        gauge
            .get_metric_with_label_values(&[self.owner_uid.as_str()])?
            .set(value);
        Ok(())
    }
}

impl MetricsSink for PrometheusSink {
    fn set_progress(&self, percent: f64) -> Result<(), MetricsError> {
        self.set(&self.progress, percent)
    }

    fn set_average_speed(&self, bytes_per_sec: f64) -> Result<(), MetricsError> {
        self.set(&self.average_speed, bytes_per_sec)
    }

    fn set_current_speed(&self, bytes_per_sec: f64) -> Result<(), MetricsError> {
        self.set(&self.current_speed, bytes_per_sec)
    }
}
