//! Top-level run: configuration, wiring, signal handling and the final report

use crate::cli::args::Args;
use crate::cli::config::ImportConfig;
use crate::error::{ImportError, Result};
use crate::image::QemuImgProbe;
use crate::importer::{ImportOrchestrator, ImportResult, RegistryDestinationFactory, RetryShell};
use crate::logging::{format_duration, init_logging};
use crate::monitoring::{ImportReport, MetricsRegistry, MetricsServer, MetricsSink, NoopSink, PrometheusSink};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Runner {
    args: Args,
    metrics: MetricsRegistry,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        Self {
            args,
            metrics: MetricsRegistry::new(),
        }
    }

    /// Run the import and write the termination report either way
    pub async fn run(&self) -> Result<ImportResult> {
        let config = ImportConfig::from_args(&self.args);
        // An unusable configuration is still logged, in the default format.
        let log_format = config
            .as_ref()
            .map(|config| config.monitoring.log_format)
            .unwrap_or_default();
        if let Err(e) = init_logging(log_format, self.args.verbose) {
            eprintln!("{}", e);
        }

        let started = Instant::now();
        let outcome = match config {
            Ok(config) => self.execute(config).await,
            Err(e) => Err(e),
        };

        let report = match &outcome {
            Ok(result) => ImportReport::success(result),
            Err(e) => {
                error!(error = %e, elapsed = %format_duration(started.elapsed()), "Import failed");
                ImportReport::failure(e)
            }
        };
        if let Err(e) = report.write_to(&self.args.report_path).await {
            warn!(
                path = %self.args.report_path.display(),
                error = %e,
                "Failed to write termination report"
            );
        }

        if let Ok(text) = self.metrics.encode_text() {
            debug!(metrics = %text, "Final metrics");
        }
        outcome
    }

    async fn execute(&self, config: ImportConfig) -> Result<ImportResult> {
        info!(
            source = %config.source.endpoint,
            destination = %config.destination.image,
            "Import configured"
        );

        let target = config.import_target().await?;
        let sources = Arc::new(config.source.to_spec().await?);
        let destinations = Arc::new(RegistryDestinationFactory {
            compression: config.destination.compression,
        });

        let probe = Arc::new(QemuImgProbe::new(
            config.inspect.qemu_img.clone(),
            config.inspect.file_cmd.clone(),
        ));
        let orchestrator =
            ImportOrchestrator::new(probe, self.metrics_sink(&config)).with_options(config.import_options());
        let shell = RetryShell::new(orchestrator, config.retry.clone(), sources, destinations);

        let metrics_server = self.start_metrics_server(&config).await;
        let cancel = CancellationToken::new();
        let signals = tokio::spawn(cancel_on_shutdown(cancel.clone()));
        let result = shell.run(&target, &cancel).await;
        signals.abort();
        if let Some(server) = metrics_server {
            server.shutdown().await;
        }
        result
    }

    /// The endpoint is best effort; an import never fails because it cannot bind
    async fn start_metrics_server(&self, config: &ImportConfig) -> Option<MetricsServer> {
        if !config.monitoring.metrics_enabled {
            return None;
        }
        match MetricsServer::start(config.monitoring.metrics_addr, self.metrics.clone()).await {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(addr = %config.monitoring.metrics_addr, error = %e, "Metrics endpoint disabled");
                None
            }
        }
    }

    fn metrics_sink(&self, config: &ImportConfig) -> Arc<dyn MetricsSink> {
        if !config.monitoring.metrics_enabled {
            return Arc::new(NoopSink);
        }
        match PrometheusSink::new(&self.metrics, config.monitoring.owner_uid.clone()) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(error = %e, "Progress metrics disabled");
                Arc::new(NoopSink)
            }
        }
    }
}

async fn cancel_on_shutdown(cancel: CancellationToken) {
    if let Err(e) = shutdown_signal().await {
        warn!(error = %e, "Failed to install signal handler");
        return;
    }
    info!("Shutdown signal received, cancelling import");
    cancel.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(ImportError::from),
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.map_err(ImportError::from)
}
