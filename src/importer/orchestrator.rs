//! One import attempt
//!
//! Three futures run in a single `try_join!` scope under the caller's
//! cancellation token:
//!
//! * produce: reads the metered source once and fans every chunk out to the
//!   checksum accumulators, the tar packager (writing into an in-memory pipe)
//!   and the inspector queue;
//! * inspect: detects format and virtual size, then publishes them through
//!   the readiness gate;
//! * consume: pushes the tar pipe as a layer, waits on the gate and pushes
//!   the manifest.
//!
//! The first error drops the other futures, which closes both pipe ends, the
//! inspector queue, any running subprocess and the temporary file.

use crate::digest::Checksums;
use crate::error::{ImportError, Result};
use crate::gate::{GateSetter, readiness_gate};
use crate::image::inspector::DEFAULT_PREFIX_SIZE;
use crate::image::config::DEFAULT_AUTHOR;
use crate::image::{FormatProbe, ImageInfo, ImageInspector, TarPackager};
use crate::importer::tee::{ChannelSink, fan_out};
use crate::importer::{ImportRequest, ImportResult};
use crate::logging::{format_duration, format_size, format_speed};
use crate::monitoring::progress::EMIT_INTERVAL;
use crate::monitoring::{MetricsSink, ProgressMeter};
use crate::registry::{ImageDestination, RegistryUploader};
use crate::source::DataSource;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TAR_PIPE_CAPACITY: usize = 1024 * 1024;
const INSPECTOR_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub prefix_size: u64,
    pub temp_dir: Option<PathBuf>,
    pub author: String,
    pub pipe_capacity: usize,
    pub progress_interval: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            prefix_size: DEFAULT_PREFIX_SIZE,
            temp_dir: None,
            author: DEFAULT_AUTHOR.to_string(),
            pipe_capacity: TAR_PIPE_CAPACITY,
            progress_interval: EMIT_INTERVAL,
        }
    }
}

pub struct ImportOrchestrator {
    probe: Arc<dyn FormatProbe>,
    metrics: Arc<dyn MetricsSink>,
    options: ImportOptions,
}

impl ImportOrchestrator {
    pub fn new(probe: Arc<dyn FormatProbe>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            probe,
            metrics,
            options: ImportOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn run(
        &self,
        request: &ImportRequest,
        mut source: Box<dyn DataSource>,
        destination: Arc<dyn ImageDestination>,
        cancel: &CancellationToken,
    ) -> Result<ImportResult> {
        if request.source_length == 0 {
            source.close();
            return Err(ImportError::Source("Source image is empty".to_string()));
        }

        let checksums = Checksums::new(request.expected_sha256.as_deref(), request.expected_md5.as_deref())?;
        let started = Instant::now();
        info!(
            source = %request.source_filename,
            size = %format_size(request.source_length),
            destination = %request.destination_image,
            "Starting import"
        );

        let mut meter = ProgressMeter::new(request.source_length, self.metrics.clone())
            .with_interval(self.options.progress_interval);
        let reader = meter.wrap(source.reader()?);
        drop(source);

        let (tar_writer, tar_reader) = tokio::io::duplex(self.options.pipe_capacity);
        let (inspector_tx, inspector_rx) = mpsc::channel(INSPECTOR_QUEUE_DEPTH);
        let (gate_setter, gate) = readiness_gate();

        let inspector = ImageInspector::new(self.probe.clone())
            .with_prefix_size(self.options.prefix_size)
            .with_temp_dir(self.options.temp_dir.clone());
        let uploader = RegistryUploader::new(destination).with_author(self.options.author.clone());

        meter.start();
        let pipeline = async {
            tokio::try_join!(
                produce(
                    reader,
                    &request.source_filename,
                    request.source_length,
                    checksums,
                    tar_writer,
                    inspector_tx,
                ),
                inspect(inspector, inspector_rx, gate_setter),
                uploader.upload(Box::new(tar_reader), request.source_length, gate.clone()),
            )
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ImportError::Cancelled),
            result = pipeline => result,
        };
        meter.stop();

        let (checksums, (), manifest_digest) = outcome?;

        if let Err(mismatch) = checksums.verify() {
            warn!(
                manifest = %manifest_digest,
                error = %mismatch,
                "Checksum verification failed after the image was pushed"
            );
            return Err(mismatch.into());
        }

        let image_info = gate
            .get()
            .ok_or_else(|| ImportError::Inspection("Image info was never published".to_string()))?;
        let result = ImportResult {
            source_image_size_bytes: request.source_length,
            virtual_size_bytes: image_info.virtual_size_bytes,
            average_speed_bytes_per_sec: meter.average_speed(),
            format: image_info.format,
        };

        info!(
            manifest = %manifest_digest,
            format = %result.format,
            virtual_size = %format_size(result.virtual_size_bytes),
            average_speed = %format_speed(result.average_speed_bytes_per_sec),
            elapsed = %format_duration(started.elapsed()),
            "Import completed"
        );
        Ok(result)
    }
}

async fn produce<R>(
    reader: R,
    filename: &str,
    length: u64,
    mut checksums: Checksums,
    tar_writer: DuplexStream,
    inspector_tx: mpsc::Sender<Bytes>,
) -> Result<Checksums>
where
    R: AsyncRead + Unpin + Send,
{
    let mut packager = TarPackager::new(tar_writer, filename, length);
    debug!(
        entry = packager.entry_path(),
        layer_size = %format_size(packager.archive_size()),
        "Packaging source as a single tar entry"
    );
    packager.write_header().await?;

    let mut inspector = ChannelSink::new(inspector_tx);
    info!("Streaming from the source");
    let transmitted = fan_out(reader, &mut [&mut checksums, &mut packager, &mut inspector]).await?;
    drop(inspector);

    if transmitted != length {
        return Err(ImportError::Source(format!(
            "Source image size mismatch: {} != {}",
            transmitted, length
        )));
    }

    packager.finish().await?;
    info!("Source streaming completed");
    Ok(checksums)
}

async fn inspect(
    inspector: ImageInspector,
    chunks: mpsc::Receiver<Bytes>,
    gate: GateSetter<ImageInfo>,
) -> Result<()> {
    let image_info = inspector.inspect(chunks).await?;
    gate.set(image_info);
    Ok(())
}
