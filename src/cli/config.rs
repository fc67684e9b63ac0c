//! Validated import configuration built from [`Args`]

use crate::cli::args::Args;
use crate::cli::auth_file::DockerConfig;
use crate::digest::ChecksumAlgorithm;
use crate::error::{ImportError, Result};
use crate::importer::{DestinationCredentials, ImportOptions, ImportTarget, RetryPolicy};
use crate::logging::LogFormat;
use crate::registry::{Credentials, ImageReference, LayerCompression};
use crate::source::SourceSpec;
use crate::source::registry::DOCKER_SCHEME_PREFIX;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Http,
    Registry,
    File,
    BlockDevice,
}

impl FromStr for SourceKind {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" => Ok(SourceKind::Http),
            "registry" => Ok(SourceKind::Registry),
            "file" => Ok(SourceKind::File),
            "block-device" | "blockdevice" => Ok(SourceKind::BlockDevice),
            other => Err(ImportError::Configuration(format!(
                "Unknown source type '{}', expected one of: http, registry, file, block-device",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub endpoint: String,
    pub credentials: Option<Credentials>,
    /// Docker config consulted for registry sources without explicit credentials
    pub auth_file: Option<PathBuf>,
    pub insecure_tls: bool,
}

impl SourceConfig {
    pub async fn to_spec(&self) -> Result<SourceSpec> {
        match self.kind {
            SourceKind::Http => Ok(SourceSpec::Http {
                url: Url::parse(&self.endpoint)?,
                credentials: self.credentials.clone(),
                insecure_tls: self.insecure_tls,
            }),
            SourceKind::Registry => {
                let image = self.registry_image()?;
                let credentials = match (&self.credentials, &self.auth_file) {
                    (Some(credentials), _) => Some(credentials.clone()),
                    (None, Some(path)) => DockerConfig::load(path).await?.credentials_for(&image)?,
                    (None, None) => None,
                };
                Ok(SourceSpec::Registry {
                    image,
                    credentials,
                    insecure_tls: self.insecure_tls,
                })
            }
            SourceKind::File => Ok(SourceSpec::File {
                path: PathBuf::from(&self.endpoint),
            }),
            SourceKind::BlockDevice => Ok(SourceSpec::BlockDevice {
                path: PathBuf::from(&self.endpoint),
            }),
        }
    }

    /// Image reference of a registry source; a `docker://` prefix is accepted
    pub fn registry_image(&self) -> Result<ImageReference> {
        let endpoint = self.endpoint.strip_prefix(DOCKER_SCHEME_PREFIX).unwrap_or(&self.endpoint);
        ImageReference::parse(endpoint)
    }
}

/// Destination credentials: explicit pair or a docker config file
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_file: Option<PathBuf>,
}

impl AuthConfig {
    /// Explicit credentials win; the auth file is only read when both are absent
    pub async fn resolve(&self, image: &ImageReference) -> Result<Option<Credentials>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials::new(username, password))),
            (Some(_), None) | (None, Some(_)) => Err(ImportError::Configuration(
                "Registry username and password must be given together".to_string(),
            )),
            (None, None) => match &self.auth_file {
                Some(path) => DockerConfig::load(path).await?.credentials_for(image),
                None => Ok(None),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub image: ImageReference,
    pub auth: AuthConfig,
    pub insecure_tls: bool,
    pub compression: LayerCompression,
}

#[derive(Debug, Clone)]
pub struct InspectConfig {
    pub qemu_img: PathBuf,
    pub file_cmd: PathBuf,
    pub prefix_size: u64,
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub metrics_enabled: bool,
    pub metrics_addr: SocketAddr,
    pub owner_uid: String,
    pub report_path: PathBuf,
    pub log_format: LogFormat,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub expected_sha256: Option<String>,
    pub expected_md5: Option<String>,
    pub inspect: InspectConfig,
    pub retry: RetryPolicy,
    pub monitoring: MonitoringConfig,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

impl ImportConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.destination.trim().is_empty() {
            return Err(ImportError::Configuration(
                "Destination image must be provided".to_string(),
            ));
        }

        let source_credentials = match (non_empty(&args.source_username), non_empty(&args.source_password)) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        };

        let config = Self {
            source: SourceConfig {
                kind: args.source.parse()?,
                endpoint: args.endpoint.trim().to_string(),
                credentials: source_credentials,
                auth_file: args.source_auth_config.clone().filter(|p| !p.as_os_str().is_empty()),
                insecure_tls: args.source_insecure_tls,
            },
            destination: DestinationConfig {
                image: args.destination.parse()?,
                auth: AuthConfig {
                    username: non_empty(&args.username),
                    password: non_empty(&args.password),
                    auth_file: args.auth_config.clone().filter(|p| !p.as_os_str().is_empty()),
                },
                insecure_tls: args.insecure_tls,
                compression: args.layer_compression.parse()?,
            },
            expected_sha256: non_empty(&args.sha256),
            expected_md5: non_empty(&args.md5),
            inspect: InspectConfig {
                qemu_img: args.qemu_img.clone(),
                file_cmd: args.file_cmd.clone(),
                prefix_size: args.inspect_prefix_size,
                temp_dir: args.temp_dir.clone(),
            },
            retry: RetryPolicy {
                max_attempts: args.retry,
                base_delay: Duration::from_secs(args.retry_delay),
                max_delay: Duration::from_secs(args.retry_max_delay),
                retry_on_checksum_mismatch: args.retry_on_checksum_mismatch,
            },
            monitoring: MonitoringConfig {
                metrics_enabled: !args.no_metrics,
                metrics_addr: args.metrics_addr,
                owner_uid: args.owner_uid.clone(),
                report_path: args.report_path.clone(),
                log_format: args.log_format.parse()?,
                verbose: args.verbose,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.endpoint.is_empty() {
            return Err(ImportError::Configuration(
                "Source endpoint must be provided".to_string(),
            ));
        }
        if self.source.kind == SourceKind::Registry {
            self.source.registry_image()?;
        }
        if let Some(sha256) = &self.expected_sha256 {
            ChecksumAlgorithm::Sha256.normalize(sha256)?;
        }
        if let Some(md5) = &self.expected_md5 {
            ChecksumAlgorithm::Md5.normalize(md5)?;
        }
        if self.retry.max_attempts == 0 {
            return Err(ImportError::Configuration(
                "Retry attempts must be at least 1".to_string(),
            ));
        }
        if self.inspect.prefix_size == 0 {
            return Err(ImportError::Configuration(
                "Inspection prefix size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve credentials and build the attempt-independent import target
    pub async fn import_target(&self) -> Result<ImportTarget> {
        let credentials = self.destination.auth.resolve(&self.destination.image).await?;
        Ok(ImportTarget {
            expected_sha256: self.expected_sha256.clone(),
            expected_md5: self.expected_md5.clone(),
            destination_image: self.destination.image.clone(),
            destination_credentials: DestinationCredentials {
                credentials,
                insecure_tls: self.destination.insecure_tls,
            },
        })
    }

    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            prefix_size: self.inspect.prefix_size,
            temp_dir: self.inspect.temp_dir.clone(),
            ..ImportOptions::default()
        }
    }
}
