use crate::error::{ImportError, Result};
use serde::{Deserialize, Serialize};

pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_TAR_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

pub const DISK_PLATFORM_OS: &str = "linux";
pub const DISK_PLATFORM_ARCHITECTURE: &str = "amd64";

/// A pushed layer blob as it is referenced from the manifest and config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Digest of the blob as stored in the registry
    pub digest: String,
    /// Digest of the uncompressed tar stream
    pub diff_id: String,
    pub size: u64,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    pub fn new(config_digest: &str, config_size: u64, layer: &LayerDescriptor) -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: OCI_CONFIG_MEDIA_TYPE.to_string(),
                size: config_size,
                digest: config_digest.to_string(),
            },
            layers: vec![Descriptor {
                media_type: layer.media_type.clone(),
                size: layer.size,
                digest: layer.digest.clone(),
            }],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 {
            return Err(ImportError::Registry(format!(
                "Unsupported manifest schema version {}",
                self.schema_version
            )));
        }
        if self.layers.len() != 1 {
            return Err(ImportError::Registry(format!(
                "Disk image manifest must contain exactly one layer, found {}",
                self.layers.len()
            )));
        }
        Ok(())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }
}

/// Image manifest or index as served by a source registry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<PlatformDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformDescriptor {
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl RemoteManifest {
    pub fn is_index(&self) -> bool {
        !self.manifests.is_empty()
            || matches!(
                self.media_type.as_deref(),
                Some(OCI_INDEX_MEDIA_TYPE | DOCKER_MANIFEST_LIST_MEDIA_TYPE)
            )
    }

    /// Index entry for linux/amd64, or the only entry when there is exactly one
    pub fn disk_platform_entry(&self) -> Option<&PlatformDescriptor> {
        self.manifests
            .iter()
            .find(|entry| {
                entry.platform.as_ref().is_some_and(|platform| {
                    platform.os == DISK_PLATFORM_OS && platform.architecture == DISK_PLATFORM_ARCHITECTURE
                })
            })
            .or_else(|| match self.manifests.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }
}
