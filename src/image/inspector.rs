//! Disk image format and virtual size detection
//!
//! The inspector receives its own copy of the source chunks. It writes a
//! bounded prefix to a temporary file, asks a [`FormatProbe`] about that file
//! and then drains the rest of the stream so the producer is never held up.
//! Compressed sources are inspected through a streaming decoder.

use crate::error::{ImportError, Result};
use crate::image::compression::{SourceCompression, StreamDecoder};
use crate::image::{ISO_FORMAT, ImageInfo, RAW_FORMAT};
use async_trait::async_trait;
use bytes::Bytes;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Number of leading bytes handed to the format tools
pub const DEFAULT_PREFIX_SIZE: u64 = 64 * 1024 * 1024;

/// External format detection
#[async_trait]
pub trait FormatProbe: Send + Sync {
    /// Report format and virtual size of the image prefix stored at `path`
    async fn inspect(&self, path: &Path) -> Result<ImageInfo>;

    /// Free-form description of the file type, used for formats `inspect` reports as raw
    async fn classify(&self, path: &Path) -> Result<String>;
}

/// Probe backed by `qemu-img info` and `file -b`
#[derive(Debug, Clone)]
pub struct QemuImgProbe {
    qemu_img: PathBuf,
    file: PathBuf,
}

impl Default for QemuImgProbe {
    fn default() -> Self {
        Self::new("qemu-img", "file")
    }
}

impl QemuImgProbe {
    pub fn new(qemu_img: impl Into<PathBuf>, file: impl Into<PathBuf>) -> Self {
        Self {
            qemu_img: qemu_img.into(),
            file: file.into(),
        }
    }

    async fn run(program: &Path, args: &[&OsStr]) -> Result<Vec<u8>> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ImportError::Inspection(format!("Failed to run {}: {}", program.display(), e))
            })?;

        if !output.status.success() {
            return Err(ImportError::Inspection(format!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl FormatProbe for QemuImgProbe {
    async fn inspect(&self, path: &Path) -> Result<ImageInfo> {
        let stdout = Self::run(
            &self.qemu_img,
            &[OsStr::new("info"), OsStr::new("--output=json"), path.as_os_str()],
        )
        .await?;
        debug!(output = %String::from_utf8_lossy(&stdout), "qemu-img info output");
        parse_qemu_img_output(&stdout)
    }

    async fn classify(&self, path: &Path) -> Result<String> {
        let stdout = Self::run(&self.file, &[OsStr::new("-b"), path.as_os_str()]).await?;
        let description = String::from_utf8_lossy(&stdout).trim().to_string();
        debug!(output = %description, "file output");
        Ok(description)
    }
}

/// Parse the JSON printed by `qemu-img info --output=json`
pub fn parse_qemu_img_output(stdout: &[u8]) -> Result<ImageInfo> {
    serde_json::from_slice(stdout)
        .map_err(|e| ImportError::Inspection(format!("Unparsable qemu-img info output: {}", e)))
}

pub struct ImageInspector {
    probe: Arc<dyn FormatProbe>,
    prefix_size: u64,
    temp_dir: Option<PathBuf>,
}

impl ImageInspector {
    pub fn new(probe: Arc<dyn FormatProbe>) -> Self {
        Self {
            probe,
            prefix_size: DEFAULT_PREFIX_SIZE,
            temp_dir: None,
        }
    }

    pub fn with_prefix_size(mut self, prefix_size: u64) -> Self {
        self.prefix_size = prefix_size;
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: Option<PathBuf>) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    /// Consume the whole chunk stream and report the image format and virtual size
    ///
    /// gzip and xz wrapped sources are decompressed before inspection, so the
    /// reported format and size describe the disk image inside.
    pub async fn inspect(&self, chunks: mpsc::Receiver<Bytes>) -> Result<ImageInfo> {
        let mut stream = DecodedChunks::open(chunks).await;

        let mut builder = tempfile::Builder::new();
        builder.prefix("image-info-");
        let temp = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut copied = 0u64;
        let mut overflow = 0u64;
        while copied < self.prefix_size {
            let Some(chunk) = stream.next().await? else {
                break;
            };
            let take = (self.prefix_size - copied).min(chunk.len() as u64) as usize;
            file.write_all(&chunk[..take]).await?;
            copied += take as u64;
            overflow += (chunk.len() - take) as u64;
        }
        file.flush().await?;
        drop(file);

        debug!(prefix_bytes = copied, path = %temp_path.display(), "Image prefix written");

        let mut image_info = self.probe.inspect(&temp_path).await?;
        if image_info.format != RAW_FORMAT {
            stream.discard().await;
            info!(
                format = %image_info.format,
                virtual_size = image_info.virtual_size_bytes,
                "Image format detected"
            );
            return Ok(image_info);
        }

        let description = self.probe.classify(&temp_path).await?;
        if description.to_lowercase().starts_with(ISO_FORMAT) {
            image_info.format = ISO_FORMAT.to_string();
        }

        let mut remaining = 0u64;
        while let Some(chunk) = stream.next().await? {
            remaining += chunk.len() as u64;
        }
        image_info.virtual_size_bytes = copied + overflow + remaining;

        info!(
            format = %image_info.format,
            virtual_size = image_info.virtual_size_bytes,
            "Image format detected"
        );
        Ok(image_info)
    }
}

/// Source chunks, decompressed when the stream starts with a gzip or xz header
struct DecodedChunks {
    chunks: mpsc::Receiver<Bytes>,
    first: Option<Bytes>,
    decoder: Option<StreamDecoder>,
    ended: bool,
}

impl DecodedChunks {
    async fn open(mut chunks: mpsc::Receiver<Bytes>) -> Self {
        let first = chunks.recv().await;
        let decoder = first
            .as_deref()
            .and_then(SourceCompression::detect)
            .map(StreamDecoder::new);
        if let Some(decoder) = &decoder {
            info!(compression = decoder.compression().name(), "Inspecting decompressed image");
        }
        Self {
            chunks,
            first,
            decoder,
            ended: false,
        }
    }

    async fn next(&mut self) -> Result<Option<Bytes>> {
        if self.ended {
            return Ok(None);
        }
        let chunk = match self.first.take() {
            Some(chunk) => Some(chunk),
            None => self.chunks.recv().await,
        };
        let Some(decoder) = &self.decoder else {
            self.ended = chunk.is_none();
            return Ok(chunk);
        };
        let decoded = match chunk {
            Some(chunk) => decoder.decode(chunk).await,
            None => {
                self.ended = true;
                decoder.finish().await
            }
        };
        decoded.map(Some).map_err(|e| {
            ImportError::Inspection(format!(
                "Failed to decompress {} image: {}",
                decoder.compression().name(),
                e
            ))
        })
    }

    /// Drop the rest of the stream without decoding it
    async fn discard(&mut self) {
        self.first = None;
        while self.chunks.recv().await.is_some() {}
        self.ended = true;
    }
}
