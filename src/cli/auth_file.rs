//! Registry credentials from a docker `config.json`

use crate::error::{ImportError, Result};
use crate::registry::{Credentials, ImageReference};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DockerAuthEntry {
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl DockerAuthEntry {
    fn credentials(&self) -> Result<Option<Credentials>> {
        if let Some(encoded) = self.auth.as_deref().filter(|a| !a.is_empty()) {
            let decoded = STANDARD
                .decode(encoded.trim())
                .map_err(|e| ImportError::Configuration(format!("Invalid auth entry: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| ImportError::Configuration(format!("Invalid auth entry: {}", e)))?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                ImportError::Configuration("Invalid auth entry: expected user:password".to_string())
            })?;
            return Ok(Some(Credentials::new(username, password)));
        }

        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials::new(username, password))),
            _ => Ok(None),
        }
    }
}

impl DockerConfig {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ImportError::Configuration(format!("Failed to read auth config {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Credentials for the registry host of `image`, if the file has an entry for it
    pub fn credentials_for(&self, image: &ImageReference) -> Result<Option<Credentials>> {
        let registry = image.registry.as_str();
        let entry = self.auths.iter().find(|(key, _)| registry_key_matches(key, registry));

        match entry {
            Some((key, entry)) => {
                debug!(registry = %registry, entry = %key, "Using credentials from auth config");
                entry.credentials()
            }
            None => Ok(None),
        }
    }
}

/// Keys may be bare hosts or full URLs such as `https://host/v1/`
fn registry_key_matches(key: &str, registry: &str) -> bool {
    let host = key
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default();
    host.eq_ignore_ascii_case(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    #[test]
    fn decodes_auth_field() {
        let config = DockerConfig::parse(r#"{"auths":{"dvcr.example.com":{"auth":"dGVzdDp0ZXN0"}}}"#).unwrap();
        let creds = config.credentials_for(&image("dvcr.example.com/vi/disk:v1")).unwrap().unwrap();
        assert_eq!(creds, Credentials::new("test", "test"));
    }

    #[test]
    fn falls_back_to_username_and_password() {
        let config = DockerConfig::parse(
            r#"{"auths":{"https://registry.local:5000/v1/":{"username":"admin","password":"p:w"}}}"#,
        )
        .unwrap();
        let creds = config.credentials_for(&image("registry.local:5000/vi/disk")).unwrap().unwrap();
        assert_eq!(creds, Credentials::new("admin", "p:w"));
    }

    #[test]
    fn unknown_registry_has_no_credentials() {
        let config = DockerConfig::parse(r#"{"auths":{"other.example.com":{"auth":"dGVzdDp0ZXN0"}}}"#).unwrap();
        assert!(config.credentials_for(&image("dvcr.example.com/vi/disk")).unwrap().is_none());
    }

    #[test]
    fn malformed_auth_is_a_configuration_error() {
        let config = DockerConfig::parse(r#"{"auths":{"dvcr.example.com":{"auth":"bm9jb2xvbg=="}}}"#).unwrap();
        let err = config.credentials_for(&image("dvcr.example.com/vi/disk")).unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dockerconfigjson");
        tokio::fs::write(&path, r#"{"auths":{"dvcr.example.com":{"auth":"dGVzdDp0ZXN0"}}}"#)
            .await
            .unwrap();

        let config = DockerConfig::load(&path).await.unwrap();
        assert_eq!(config.auths.len(), 1);

        let missing = DockerConfig::load(&dir.path().join("absent")).await.unwrap_err();
        assert!(matches!(missing, ImportError::Configuration(_)));
    }
}
