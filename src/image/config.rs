//! OCI image configuration for a single-layer disk image

use crate::image::ImageInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const LABEL_SOURCE_IMAGE_SIZE: &str = "source-image-size";
pub const LABEL_SOURCE_IMAGE_VIRTUAL_SIZE: &str = "source-image-virtual-size";
pub const LABEL_SOURCE_IMAGE_FORMAT: &str = "source-image-format";
/// Marks layers written as complete tar archives
pub const LABEL_EROFS_COMPATIBLE: &str = "erofs-compatible-layers";

pub const IMAGE_ARCHITECTURE: &str = "amd64";
pub const IMAGE_OS: &str = "linux";
pub const IMAGE_WORKING_DIR: &str = "/";
pub const DEFAULT_AUTHOR: &str = "disk-image-importer";
const HISTORY_COMMENT: &str = "streamed from the datasource";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub created: DateTime<Utc>,
    pub author: String,
    pub architecture: String,
    pub os: String,
    pub config: ContainerConfig,
    pub rootfs: RootFs,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "WorkingDir")]
    pub working_dir: String,
    #[serde(rename = "Labels", default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: DateTime<Utc>,
    pub author: String,
    pub comment: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl ImageConfig {
    /// Config with the common fields populated and no layers yet
    pub fn new(author: &str) -> Self {
        let now = Utc::now();
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_EROFS_COMPATIBLE.to_string(), "true".to_string());

        Self {
            created: now,
            author: author.to_string(),
            architecture: IMAGE_ARCHITECTURE.to_string(),
            os: IMAGE_OS.to_string(),
            config: ContainerConfig {
                working_dir: IMAGE_WORKING_DIR.to_string(),
                labels,
            },
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: Vec::new(),
            },
            history: vec![HistoryEntry {
                created: now,
                author: author.to_string(),
                comment: HISTORY_COMMENT.to_string(),
                empty_layer: false,
            }],
        }
    }

    /// Attach the source size, virtual size and format labels
    pub fn with_source_labels(mut self, source_size: u64, info: &ImageInfo) -> Self {
        let labels = &mut self.config.labels;
        labels.insert(LABEL_SOURCE_IMAGE_SIZE.to_string(), source_size.to_string());
        labels.insert(
            LABEL_SOURCE_IMAGE_VIRTUAL_SIZE.to_string(),
            info.virtual_size_bytes.to_string(),
        );
        labels.insert(LABEL_SOURCE_IMAGE_FORMAT.to_string(), info.format.clone());
        self
    }

    /// Register the uncompressed digest of an appended layer
    pub fn with_layer(mut self, diff_id: &str) -> Self {
        self.rootfs.diff_ids.push(diff_id.to_string());
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_and_layer_are_attached() {
        let info = ImageInfo {
            virtual_size_bytes: 10 * 1024 * 1024,
            format: "raw".to_string(),
        };
        let config = ImageConfig::new(DEFAULT_AUTHOR)
            .with_source_labels(5_000_000, &info)
            .with_layer("sha256:abc");

        assert_eq!(config.label(LABEL_SOURCE_IMAGE_SIZE), Some("5000000"));
        assert_eq!(config.label(LABEL_SOURCE_IMAGE_VIRTUAL_SIZE), Some("10485760"));
        assert_eq!(config.label(LABEL_SOURCE_IMAGE_FORMAT), Some("raw"));
        assert_eq!(config.rootfs.diff_ids, vec!["sha256:abc".to_string()]);
    }

    #[test]
    fn serializes_with_oci_field_names() {
        let json: serde_json::Value =
            serde_json::from_slice(&ImageConfig::new("tester").to_json_bytes().unwrap()).unwrap();

        assert_eq!(json["architecture"], "amd64");
        assert_eq!(json["os"], "linux");
        assert_eq!(json["config"]["WorkingDir"], "/");
        assert_eq!(json["config"]["Labels"][LABEL_EROFS_COMPATIBLE], "true");
        assert_eq!(json["rootfs"]["type"], "layers");
        assert_eq!(json["history"][0]["comment"], "streamed from the datasource");
        assert!(json["history"][0].get("empty_layer").is_none());
    }
}
