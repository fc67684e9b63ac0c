//! Retry loop around import attempts
//!
//! Every attempt opens a fresh source and a fresh destination client; nothing
//! is carried over from a failed attempt.

use crate::error::{ImportError, Result};
use crate::importer::{ImportOrchestrator, ImportRequest, ImportResult, ImportTarget};
use crate::registry::{ImageDestination, LayerCompression, RegistryClient};
use crate::source::SourceFactory;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_on_checksum_mismatch: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            retry_on_checksum_mismatch: false,
        }
    }
}

impl RetryPolicy {
    /// Run exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt + 1`; doubles per attempt, capped
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(4);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    pub fn should_retry(&self, error: &ImportError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        error.is_retryable() || (self.retry_on_checksum_mismatch && error.is_checksum_mismatch())
    }
}

/// Builds the destination handle of one attempt
pub trait DestinationFactory: Send + Sync {
    fn create(&self, request: &ImportRequest) -> Result<Arc<dyn ImageDestination>>;
}

/// Destination factory producing registry clients
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryDestinationFactory {
    pub compression: LayerCompression,
}

impl DestinationFactory for RegistryDestinationFactory {
    fn create(&self, request: &ImportRequest) -> Result<Arc<dyn ImageDestination>> {
        let client = RegistryClient::builder(request.destination_image.clone())
            .with_credentials(request.destination_credentials.credentials.clone())
            .with_skip_tls(request.destination_credentials.insecure_tls)
            .with_compression(self.compression)
            .build()?;
        Ok(Arc::new(client))
    }
}

pub struct RetryShell {
    orchestrator: ImportOrchestrator,
    policy: RetryPolicy,
    sources: Arc<dyn SourceFactory>,
    destinations: Arc<dyn DestinationFactory>,
}

impl RetryShell {
    pub fn new(
        orchestrator: ImportOrchestrator,
        policy: RetryPolicy,
        sources: Arc<dyn SourceFactory>,
        destinations: Arc<dyn DestinationFactory>,
    ) -> Self {
        Self {
            orchestrator,
            policy,
            sources,
            destinations,
        }
    }

    pub async fn run(&self, target: &ImportTarget, cancel: &CancellationToken) -> Result<ImportResult> {
        let mut attempt = 1;
        loop {
            info!(attempt, max_attempts = self.policy.max_attempts, "Starting import attempt");

            let error = match self.attempt(target, cancel).await {
                Ok(result) => return Ok(result),
                Err(error) => error,
            };

            if !self.policy.should_retry(&error, attempt) {
                return Err(error);
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                attempt,
                error = %error,
                delay_secs = delay.as_secs_f64(),
                "Import attempt failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ImportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, target: &ImportTarget, cancel: &CancellationToken) -> Result<ImportResult> {
        let source = tokio::select! {
            _ = cancel.cancelled() => return Err(ImportError::Cancelled),
            source = self.sources.open() => source?,
        };
        let request = ImportRequest::new(&*source, target);
        let destination = self.destinations.create(&request)?;
        self.orchestrator.run(&request, source, destination, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChecksumMismatch;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
            retry_on_checksum_mismatch: false,
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(16));
        assert_eq!(policy.delay_after(9), Duration::from_secs(20));
    }

    #[test]
    fn retry_decisions() {
        let policy = RetryPolicy::default();
        let transient = ImportError::Registry("503".to_string());
        let mismatch = ImportError::from(ChecksumMismatch {
            algorithm: "md5".to_string(),
            expected: "a".to_string(),
            actual: "b".to_string(),
        });

        assert!(policy.should_retry(&transient, 1));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&mismatch, 1));
        assert!(!policy.should_retry(&ImportError::Cancelled, 1));

        let lenient = RetryPolicy {
            retry_on_checksum_mismatch: true,
            ..RetryPolicy::default()
        };
        assert!(lenient.should_retry(&mismatch, 1));
        assert!(!RetryPolicy::no_retry().should_retry(&transient, 1));
    }
}
