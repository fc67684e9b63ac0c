//! Final termination report of an import run

use crate::error::{ImportError, Result};
use crate::importer::ImportResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// JSON document written once per run; success fields and `error-message` are exclusive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImportReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image_virtual_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_speed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ImportReport {
    pub fn success(result: &ImportResult) -> Self {
        Self {
            source_image_size: Some(result.source_image_size_bytes),
            source_image_virtual_size: Some(result.virtual_size_bytes),
            source_image_format: Some(result.format.clone()),
            average_speed: Some(result.average_speed_bytes_per_sec),
            error_message: None,
        }
    }

    pub fn failure(error: &ImportError) -> Self {
        Self {
            error_message: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Write the report, replacing whatever the file held before
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        debug!(path = %path.display(), "Writing termination report");
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_report_uses_kebab_case_keys() {
        let result = ImportResult {
            source_image_size_bytes: 5_000_000,
            virtual_size_bytes: 10_737_418_240,
            average_speed_bytes_per_sec: 1234,
            format: "qcow2".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&ImportReport::success(&result).to_json().unwrap()).unwrap();

        assert_eq!(json["source-image-size"], 5_000_000);
        assert_eq!(json["source-image-virtual-size"], 10_737_418_240u64);
        assert_eq!(json["source-image-format"], "qcow2");
        assert_eq!(json["average-speed"], 1234);
        assert!(json.get("error-message").is_none());
    }

    #[tokio::test]
    async fn failure_report_only_carries_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termination-log");

        let report = ImportReport::failure(&ImportError::Source("connection reset".to_string()));
        report.write_to(&path).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, r#"{"error-message":"Source error: connection reset"}"#);
        let parsed: ImportReport = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed, report);
    }
}
