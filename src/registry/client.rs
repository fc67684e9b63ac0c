//! Docker Registry HTTP API v2 client
//!
//! Pushes the single-layer disk image, and pulls manifests and blobs when a
//! registry is the import source. The client negotiates scheme and
//! authentication lazily on first use: `GET /v2/` is tried over https (and
//! http as well for insecure registries); a `401` challenge is resolved into
//! basic auth or a bearer token scoped to the repository with the configured
//! [`AccessScope`].

use crate::digest::compute_oci_digest;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{ImportError, Result};
use crate::image::manifest::{
    DOCKER_MANIFEST_LIST_MEDIA_TYPE, DOCKER_MANIFEST_MEDIA_TYPE, OCI_INDEX_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use crate::image::{ImageConfig, LayerDescriptor, OciManifest, RemoteManifest};
use crate::registry::auth::{AccessScope, AuthChallenge, Credentials, RegistryAuth};
use crate::registry::blob::{LayerCompression, LayerEncoder, encode_stream};
use crate::registry::reference::{ImageReference, Scheme};
use crate::registry::uploader::ImageDestination;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Client, Response, StatusCode};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Manifest media types accepted when pulling
const MANIFEST_ACCEPT: [&str; 4] = [
    OCI_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

pub struct RegistryClientBuilder {
    reference: ImageReference,
    credentials: Option<Credentials>,
    skip_tls: bool,
    compression: LayerCompression,
    access: AccessScope,
}

impl RegistryClientBuilder {
    pub fn new(reference: ImageReference) -> Self {
        Self {
            reference,
            credentials: None,
            skip_tls: false,
            compression: LayerCompression::default(),
            access: AccessScope::default(),
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_skip_tls(mut self, skip_tls: bool) -> Self {
        self.skip_tls = skip_tls;
        self
    }

    pub fn with_compression(mut self, compression: LayerCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_access(mut self, access: AccessScope) -> Self {
        self.access = access;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let client = if self.skip_tls {
            Client::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?
        } else {
            Client::builder().build()?
        };

        Ok(RegistryClient {
            client,
            reference: self.reference,
            credentials: self.credentials,
            skip_tls: self.skip_tls,
            compression: self.compression,
            access: self.access,
            session: OnceCell::new(),
        })
    }
}

/// Negotiated base URL and authorization
#[derive(Debug)]
struct Session {
    base_url: Url,
    auth: RegistryAuth,
}

pub struct RegistryClient {
    client: Client,
    reference: ImageReference,
    credentials: Option<Credentials>,
    skip_tls: bool,
    compression: LayerCompression,
    access: AccessScope,
    session: OnceCell<Session>,
}

impl RegistryClient {
    pub fn builder(reference: ImageReference) -> RegistryClientBuilder {
        RegistryClientBuilder::new(reference)
    }

    fn candidate_schemes(&self) -> Vec<Scheme> {
        match self.reference.scheme {
            Some(scheme) => vec![scheme],
            None if self.skip_tls => vec![Scheme::Https, Scheme::Http],
            None => vec![Scheme::Https],
        }
    }

    async fn session(&self) -> Result<&Session> {
        self.session.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<Session> {
        let schemes = self.candidate_schemes();
        let mut last_error = None;

        for scheme in schemes {
            let base_url = Url::parse(&format!("{}://{}/", scheme.as_str(), self.reference.registry))?;
            let ping_url = base_url.join("v2/")?;
            debug!(url = %ping_url, "Checking registry API v2");

            let response = match self.client.get(ping_url).send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!(scheme = scheme.as_str(), error = %e, "Registry ping failed");
                    last_error = Some(ImportError::from(e));
                    continue;
                }
            };

            let auth = match response.status() {
                status if status.is_success() => RegistryAuth::Anonymous,
                StatusCode::UNAUTHORIZED => {
                    let challenge = response
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|value| value.to_str().ok())
                        .and_then(AuthChallenge::parse);
                    self.resolve_challenge(challenge).await?
                }
                status => {
                    let error_text = read_error_text(response).await;
                    return Err(HttpErrorHandler::handle_registry_error(status, &error_text, "registry ping"));
                }
            };

            info!(registry = %base_url, "Connected to registry");
            return Ok(Session { base_url, auth });
        }

        Err(last_error.unwrap_or_else(|| {
            ImportError::Registry(format!("Registry {} is unreachable", self.reference.registry))
        }))
    }

    async fn resolve_challenge(&self, challenge: Option<AuthChallenge>) -> Result<RegistryAuth> {
        let challenge = challenge.ok_or_else(|| {
            ImportError::Authentication(
                "Registry returned 401 without a supported WWW-Authenticate challenge".to_string(),
            )
        })?;

        debug!(?challenge, "Resolving registry auth challenge");
        RegistryAuth::from_challenge(
            &self.client,
            &challenge,
            &self.reference.repository,
            self.access,
            self.credentials.as_ref(),
        )
        .await
    }

    fn repository_url(session: &Session, repository: &str, path: &str) -> Result<Url> {
        Ok(session.base_url.join(&format!("v2/{}/{}", repository, path))?)
    }

    /// Open an upload session and return its location
    async fn start_upload(&self, session: &Session) -> Result<Url> {
        let url = Self::repository_url(session, &self.reference.repository, "blobs/uploads/")?;
        let response = session
            .auth
            .apply(self.client.post(url).header(CONTENT_LENGTH, "0"))
            .send()
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            let status = response.status();
            let error_text = read_error_text(response).await;
            return Err(HttpErrorHandler::handle_upload_error(status, &error_text, "upload session start"));
        }

        upload_location(session, &response)
    }

    async fn complete_upload(&self, session: &Session, mut location: Url, digest: &str, body: Body) -> Result<()> {
        location.query_pairs_mut().append_pair("digest", digest);
        let response = session
            .auth
            .apply(
                self.client
                    .put(location)
                    .header(CONTENT_TYPE, "application/octet-stream"),
            )
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = read_error_text(response).await;
            return Err(HttpErrorHandler::handle_upload_error(status, &error_text, "blob upload completion"));
        }
        Ok(())
    }

    async fn blob_exists(&self, session: &Session, digest: &str) -> Result<bool> {
        let url = Self::repository_url(session, &self.reference.repository, &format!("blobs/{}", digest))?;
        let response = session.auth.apply(self.client.head(url)).send().await?;
        Ok(response.status().is_success())
    }

    /// Single PUT upload for small blobs such as the image config
    async fn upload_blob(&self, session: &Session, data: Vec<u8>, digest: &str) -> Result<()> {
        if self.blob_exists(session, digest).await? {
            debug!(digest, "Blob already present, skipping upload");
            return Ok(());
        }
        let location = self.start_upload(session).await?;
        self.complete_upload(session, location, digest, Body::from(data)).await
    }

    /// Fetch the image manifest; an index is resolved to its linux/amd64 entry
    pub async fn fetch_manifest(&self) -> Result<RemoteManifest> {
        let session = self.session().await?;
        let manifest = self.get_manifest(session, self.reference.reference_str()).await?;
        if !manifest.is_index() {
            return Ok(manifest);
        }

        let entry = manifest.disk_platform_entry().ok_or_else(|| {
            ImportError::Registry(format!("{} has no linux/amd64 manifest", self.reference))
        })?;
        debug!(digest = %entry.digest, "Resolved image index");
        let resolved = self.get_manifest(session, &entry.digest).await?;
        if resolved.is_index() {
            return Err(ImportError::Registry(format!(
                "{} resolves to a nested image index",
                self.reference
            )));
        }
        Ok(resolved)
    }

    async fn get_manifest(&self, session: &Session, reference: &str) -> Result<RemoteManifest> {
        let url = Self::repository_url(session, &self.reference.repository, &format!("manifests/{}", reference))?;
        let response = session
            .auth
            .apply(self.client.get(url).header(ACCEPT, MANIFEST_ACCEPT.join(", ")))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = read_error_text(response).await;
            return Err(HttpErrorHandler::handle_registry_error(status, &error_text, "manifest fetch"));
        }
        Ok(response.json().await?)
    }

    /// Start downloading a blob; the body is left to the caller to stream
    pub async fn fetch_blob(&self, digest: &str) -> Result<Response> {
        let session = self.session().await?;
        let url = Self::repository_url(session, &self.reference.repository, &format!("blobs/{}", digest))?;
        let response = session.auth.apply(self.client.get(url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = read_error_text(response).await;
            return Err(HttpErrorHandler::handle_registry_error(status, &error_text, "blob fetch"));
        }
        Ok(response)
    }

    async fn put_manifest(&self, session: &Session, manifest: &OciManifest) -> Result<String> {
        let body = manifest.to_json_bytes()?;
        let computed_digest = compute_oci_digest(&body);
        let url = Self::repository_url(
            session,
            &self.reference.repository,
            &format!("manifests/{}", self.reference.reference_str()),
        )?;

        let response = session
            .auth
            .apply(self.client.put(url).header(CONTENT_TYPE, OCI_MANIFEST_MEDIA_TYPE))
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = read_error_text(response).await;
            return Err(HttpErrorHandler::handle_registry_error(status, &error_text, "manifest upload"));
        }

        let digest = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or(computed_digest);
        Ok(digest)
    }
}

#[async_trait]
impl ImageDestination for RegistryClient {
    async fn push_layer(&self, layer: Box<dyn AsyncRead + Send + Unpin>) -> Result<LayerDescriptor> {
        let session = self.session().await?;
        let location = self.start_upload(session).await?;

        let encoder = Arc::new(Mutex::new(LayerEncoder::new(self.compression)));
        let body = Body::wrap_stream(encode_stream(layer, encoder.clone()));

        debug!(location = %location, "Streaming layer");
        let response = session
            .auth
            .apply(
                self.client
                    .patch(location)
                    .header(CONTENT_TYPE, "application/octet-stream"),
            )
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = read_error_text(response).await;
            return Err(HttpErrorHandler::handle_upload_error(status, &error_text, "layer upload"));
        }

        let location = upload_location(session, &response)?;
        let descriptor = encoder.lock().descriptor();
        self.complete_upload(session, location, &descriptor.digest, Body::from(Vec::new()))
            .await?;

        info!(digest = %descriptor.digest, size = descriptor.size, "Layer uploaded");
        Ok(descriptor)
    }

    async fn push_image(&self, config: &ImageConfig, layer: &LayerDescriptor) -> Result<String> {
        let session = self.session().await?;

        let config_bytes = config.to_json_bytes()?;
        let config_digest = compute_oci_digest(&config_bytes);
        let config_size = config_bytes.len() as u64;
        self.upload_blob(session, config_bytes, &config_digest).await?;
        debug!(digest = %config_digest, "Config uploaded");

        let manifest = OciManifest::new(&config_digest, config_size, layer);
        let digest = self.put_manifest(session, &manifest).await?;
        info!(image = %self.reference, digest = %digest, "Manifest pushed");
        Ok(digest)
    }
}

fn upload_location(session: &Session, response: &Response) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .ok_or_else(|| ImportError::Registry("Missing Location header in upload response".to_string()))?
        .to_str()
        .map_err(|e| ImportError::Registry(format!("Invalid Location header: {}", e)))?;

    Ok(session.base_url.join(location)?)
}

async fn read_error_text(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string())
}
