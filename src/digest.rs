//! Digest utilities and running checksum verification
//!
//! [`ChecksumAccumulator`] hashes the source bytes as they stream past and is
//! verified once the whole source has been consumed. [`Checksums`] groups the
//! optional sha256 and md5 accumulators of one import attempt.

use crate::error::{ChecksumMismatch, ImportError, Result};
use md5::Md5;
use sha2::{Digest, Sha256};

/// Compute SHA256 digest (lowercase hex) from byte data
pub fn compute_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute full OCI digest (with sha256: prefix) from byte data
pub fn compute_oci_digest(data: &[u8]) -> String {
    format!("sha256:{}", compute_sha256(data))
}

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Md5 => 32,
        }
    }

    /// Normalize a user supplied digest: lowercase hex, optional `<algo>:` prefix stripped
    pub fn normalize(&self, digest: &str) -> Result<String> {
        let trimmed = digest.trim();
        let prefix = format!("{}:", self.name());
        let hex_part = trimmed.strip_prefix(prefix.as_str()).unwrap_or(trimmed);

        if hex_part.len() != self.hex_len() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ImportError::Configuration(format!(
                "Invalid {} checksum '{}': expected {} hex characters",
                self.name(),
                digest,
                self.hex_len()
            )));
        }

        Ok(hex_part.to_ascii_lowercase())
    }
}

enum Hasher {
    Sha256(Sha256),
    Md5(Md5),
}

/// Running digest over the streamed source, compared against an expected value at the end
pub struct ChecksumAccumulator {
    algorithm: ChecksumAlgorithm,
    expected: String,
    hasher: Hasher,
}

impl ChecksumAccumulator {
    pub fn new(algorithm: ChecksumAlgorithm, expected: &str) -> Result<Self> {
        let expected = algorithm.normalize(expected)?;
        let hasher = match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => Hasher::Md5(Md5::new()),
        };

        Ok(Self {
            algorithm,
            expected,
            hasher,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    /// Finalize the digest and compare it with the expected value
    pub fn verify(self) -> std::result::Result<(), ChecksumMismatch> {
        let actual = match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Md5(h) => hex::encode(h.finalize()),
        };

        if actual == self.expected {
            Ok(())
        } else {
            Err(ChecksumMismatch {
                algorithm: self.algorithm.name().to_string(),
                expected: self.expected,
                actual,
            })
        }
    }
}

/// The checksum accumulators of one attempt; only algorithms with an expected value are present
#[derive(Default)]
pub struct Checksums {
    accumulators: Vec<ChecksumAccumulator>,
}

impl Checksums {
    pub fn new(expected_sha256: Option<&str>, expected_md5: Option<&str>) -> Result<Self> {
        let mut accumulators = Vec::new();
        if let Some(expected) = expected_sha256 {
            accumulators.push(ChecksumAccumulator::new(ChecksumAlgorithm::Sha256, expected)?);
        }
        if let Some(expected) = expected_md5 {
            accumulators.push(ChecksumAccumulator::new(ChecksumAlgorithm::Md5, expected)?);
        }
        Ok(Self { accumulators })
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    pub fn update(&mut self, data: &[u8]) {
        for accumulator in &mut self.accumulators {
            accumulator.update(data);
        }
    }

    /// Verify all accumulators, reporting the first mismatch
    pub fn verify(self) -> std::result::Result<(), ChecksumMismatch> {
        for accumulator in self.accumulators {
            accumulator.verify()?;
        }
        Ok(())
    }
}
