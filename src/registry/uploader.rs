//! Consumer side of an import: push the layer, then finalize the image
//!
//! The manifest is only written after the layer upload returned and the
//! inspector published the image info through the readiness gate.

use crate::error::{ImportError, Result};
use crate::gate::ReadinessGate;
use crate::image::config::DEFAULT_AUTHOR;
use crate::image::{ImageConfig, ImageInfo, LayerDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// Where the packaged image ends up
#[async_trait]
pub trait ImageDestination: Send + Sync {
    /// Upload the tar stream as a layer blob, reading it to the end
    async fn push_layer(&self, layer: Box<dyn AsyncRead + Send + Unpin>) -> Result<LayerDescriptor>;

    /// Upload the config and the manifest referencing `layer`; returns the manifest digest
    async fn push_image(&self, config: &ImageConfig, layer: &LayerDescriptor) -> Result<String>;
}

pub struct RegistryUploader {
    destination: Arc<dyn ImageDestination>,
    author: String,
}

impl RegistryUploader {
    pub fn new(destination: Arc<dyn ImageDestination>) -> Self {
        Self {
            destination,
            author: DEFAULT_AUTHOR.to_string(),
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub async fn upload(
        &self,
        layer: Box<dyn AsyncRead + Send + Unpin>,
        source_size: u64,
        image_info: ReadinessGate<ImageInfo>,
    ) -> Result<String> {
        let descriptor = self.destination.push_layer(layer).await?;
        debug!(digest = %descriptor.digest, "Layer pushed, waiting for image info");

        let image_info = image_info.wait().await.map_err(|e| {
            ImportError::Inspection(format!("Image info unavailable: {}", e))
        })?;

        let config = ImageConfig::new(&self.author)
            .with_source_labels(source_size, &image_info)
            .with_layer(&descriptor.diff_id);

        let digest = self.destination.push_image(&config, &descriptor).await?;
        info!(
            digest = %digest,
            format = %image_info.format,
            virtual_size = image_info.virtual_size_bytes,
            "Image pushed"
        );
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::readiness_gate;
    use crate::image::config::{LABEL_SOURCE_IMAGE_FORMAT, LABEL_SOURCE_IMAGE_SIZE};
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
        config: Mutex<Option<ImageConfig>>,
    }

    #[async_trait]
    impl ImageDestination for Recording {
        async fn push_layer(&self, mut layer: Box<dyn AsyncRead + Send + Unpin>) -> Result<LayerDescriptor> {
            let mut data = Vec::new();
            layer.read_to_end(&mut data).await?;
            self.events.lock().push(format!("layer:{}", data.len()));
            Ok(LayerDescriptor {
                digest: "sha256:blob".to_string(),
                diff_id: "sha256:diff".to_string(),
                size: data.len() as u64,
                media_type: "application/vnd.oci.image.layer.v1.tar".to_string(),
            })
        }

        async fn push_image(&self, config: &ImageConfig, _layer: &LayerDescriptor) -> Result<String> {
            self.events.lock().push("manifest".to_string());
            *self.config.lock() = Some(config.clone());
            Ok("sha256:manifest".to_string())
        }
    }

    #[tokio::test]
    async fn manifest_waits_for_the_gate() {
        let destination = Arc::new(Recording::default());
        let uploader = RegistryUploader::new(destination.clone());
        let (setter, gate) = readiness_gate();

        let upload = tokio::spawn(async move { uploader.upload(Box::new(&b"tarbytes"[..]), 8, gate).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*destination.events.lock(), vec!["layer:8".to_string()]);

        setter.set(ImageInfo {
            virtual_size_bytes: 1 << 30,
            format: "qcow2".to_string(),
        });
        assert_eq!(upload.await.unwrap().unwrap(), "sha256:manifest");

        assert_eq!(*destination.events.lock(), vec!["layer:8".to_string(), "manifest".to_string()]);
        let config = destination.config.lock().clone().unwrap();
        assert_eq!(config.label(LABEL_SOURCE_IMAGE_SIZE), Some("8"));
        assert_eq!(config.label(LABEL_SOURCE_IMAGE_FORMAT), Some("qcow2"));
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:diff".to_string()]);
    }

    #[tokio::test]
    async fn closed_gate_fails_without_manifest() {
        let destination = Arc::new(Recording::default());
        let uploader = RegistryUploader::new(destination.clone());
        let (setter, gate) = readiness_gate();
        drop(setter);

        let err = uploader.upload(Box::new(&b"x"[..]), 1, gate).await.unwrap_err();
        assert!(matches!(err, ImportError::Inspection(_)));
        assert_eq!(*destination.events.lock(), vec!["layer:1".to_string()]);
    }
}
