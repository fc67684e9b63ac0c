//! Error types for the import pipeline
//!
//! Every fallible operation in the crate returns [`ImportError`]. The variants
//! follow the failure taxonomy of an import attempt: problems with the source,
//! with format inspection, with the destination registry, and the post-hoc
//! checksum mismatch which is reported separately from transport failures.

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImportError>;

/// Computed digest of the source did not match the expected one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{algorithm} checksum mismatch: expected {expected}, got {actual}")]
pub struct ChecksumMismatch {
    pub algorithm: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Error)]
pub enum ImportError {
    /// Source is empty, unreadable, or delivered a different number of bytes than declared
    #[error("Source error: {0}")]
    Source(String),
    /// External format tools failed or produced unusable output
    #[error("Inspection error: {0}")]
    Inspection(String),
    /// Reference parsing, upload or manifest failures
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("Authentication error: {0}")]
    Authentication(String),
    #[error(transparent)]
    Checksum(#[from] ChecksumMismatch),
    #[error("No space left: {0}")]
    NoSpaceLeft(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Import cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ImportError {
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(self, ImportError::Checksum(_))
    }

    /// Whether a fresh attempt could plausibly succeed.
    ///
    /// Configuration problems, cancellation and checksum mismatches are
    /// terminal; the retry policy decides separately whether to override the
    /// checksum case.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ImportError::Configuration(_) | ImportError::Cancelled | ImportError::Checksum(_)
        )
    }
}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        if handlers::is_no_space_left(&err) {
            ImportError::NoSpaceLeft(err.to_string())
        } else {
            ImportError::Io(err)
        }
    }
}
