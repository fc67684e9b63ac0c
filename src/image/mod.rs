//! Disk image handling
//!
//! This module covers everything that looks at or wraps the disk image
//! bytes: format inspection ([`ImageInspector`] behind the [`FormatProbe`]
//! trait, with gzip and xz sources decoded by [`compression`]), single-entry tar packaging ([`TarPackager`]) and the OCI image
//! config and manifest documents pushed alongside the layer.

pub mod compression;
pub mod config;
pub mod inspector;
pub mod manifest;
pub mod tar_packager;

pub use config::ImageConfig;
pub use inspector::{FormatProbe, ImageInspector, QemuImgProbe};
pub use manifest::{LayerDescriptor, OciManifest, RemoteManifest};
pub use tar_packager::TarPackager;

use serde::{Deserialize, Serialize};

/// Format name reported for images the format tool cannot classify
pub const RAW_FORMAT: &str = "raw";
/// Format name for optical-disc images recognised by the classifier
pub const ISO_FORMAT: &str = "iso";

/// Format and virtual size of the streamed disk image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size_bytes: u64,
    pub format: String,
}
