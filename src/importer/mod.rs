//! Import pipeline: one attempt ([`ImportOrchestrator`]) and the retry loop around it ([`RetryShell`])

pub mod orchestrator;
pub mod retry;
pub mod tee;

pub use orchestrator::{ImportOptions, ImportOrchestrator};
pub use retry::{DestinationFactory, RegistryDestinationFactory, RetryPolicy, RetryShell};

use crate::registry::{Credentials, ImageReference};
use crate::source::DataSource;

/// Destination access settings
#[derive(Debug, Clone, Default)]
pub struct DestinationCredentials {
    pub credentials: Option<Credentials>,
    pub insecure_tls: bool,
}

/// Attempt-independent part of an import: what to verify and where to push
#[derive(Debug, Clone)]
pub struct ImportTarget {
    pub expected_sha256: Option<String>,
    pub expected_md5: Option<String>,
    pub destination_image: ImageReference,
    pub destination_credentials: DestinationCredentials,
}

/// Everything one attempt needs to know; immutable for the attempt
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub source_filename: String,
    pub source_length: u64,
    pub expected_sha256: Option<String>,
    pub expected_md5: Option<String>,
    pub destination_image: ImageReference,
    pub destination_credentials: DestinationCredentials,
}

impl ImportRequest {
    pub fn new(source: &dyn DataSource, target: &ImportTarget) -> Self {
        Self {
            source_filename: source.filename().to_string(),
            source_length: source.length(),
            expected_sha256: target.expected_sha256.clone(),
            expected_md5: target.expected_md5.clone(),
            destination_image: target.destination_image.clone(),
            destination_credentials: target.destination_credentials.clone(),
        }
    }
}

/// Outcome of a successful import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub source_image_size_bytes: u64,
    pub virtual_size_bytes: u64,
    pub average_speed_bytes_per_sec: u64,
    pub format: String,
}
