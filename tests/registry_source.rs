//! Registry source tests against an in-process registry serving the v2 pull API

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use disk_image_importer::digest::compute_oci_digest;
use disk_image_importer::error::ImportError;
use disk_image_importer::image::manifest::{
    OCI_INDEX_MEDIA_TYPE, OCI_LAYER_GZIP_MEDIA_TYPE, OCI_LAYER_TAR_MEDIA_TYPE, OCI_MANIFEST_MEDIA_TYPE,
};
use disk_image_importer::registry::ImageReference;
use disk_image_importer::source::{DataSource, SourceFactory, SourceSpec};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

const TOKEN: &str = "pull-token";

#[derive(Default)]
struct StubRegistry {
    addr: Option<SocketAddr>,
    manifests: HashMap<String, (&'static str, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
    scopes: Mutex<Vec<String>>,
}

impl StubRegistry {
    fn add_blob(&mut self, blob: Vec<u8>) -> String {
        let digest = compute_oci_digest(&blob);
        self.blobs.insert(digest.clone(), blob);
        digest
    }

    fn add_manifest(&mut self, reference: Option<&str>, media_type: &'static str, body: serde_json::Value) -> String {
        let body = serde_json::to_vec(&body).unwrap();
        let digest = compute_oci_digest(&body);
        if let Some(reference) = reference {
            self.manifests.insert(reference.to_string(), (media_type, body.clone()));
        }
        self.manifests.insert(digest.clone(), (media_type, body));
        digest
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {}", TOKEN))
}

async fn ping(State(stub): State<Arc<StubRegistry>>) -> Response {
    let addr = stub.addr.unwrap();
    let challenge = format!(r#"Bearer realm="http://{}/token",service="stub-registry""#, addr);
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, challenge)]).into_response()
}

async fn token(State(stub): State<Arc<StubRegistry>>, Query(params): Query<HashMap<String, String>>) -> Response {
    stub.scopes.lock().push(params.get("scope").cloned().unwrap_or_default());
    axum::Json(json!({ "token": TOKEN })).into_response()
}

async fn manifest(
    State(stub): State<Arc<StubRegistry>>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match stub.manifests.get(&reference) {
        Some((media_type, body)) => ([(header::CONTENT_TYPE, *media_type)], body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn blob(State(stub): State<Arc<StubRegistry>>, Path(digest): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match stub.blobs.get(&digest) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve(mut stub: StubRegistry) -> (SocketAddr, Arc<StubRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    stub.addr = Some(addr);
    let stub = Arc::new(stub);

    let router = Router::new()
        .route("/v2/", get(ping))
        .route("/token", get(token))
        .route("/v2/vi/fedora/manifests/:reference", get(manifest))
        .route("/v2/vi/fedora/blobs/:digest", get(blob))
        .with_state(stub.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, stub)
}

fn layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn image_manifest(layers: &[(&str, &[u8])]) -> serde_json::Value {
    json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 2,
            "digest": compute_oci_digest(b"{}"),
        },
        "layers": layers
            .iter()
            .map(|(media_type, blob)| json!({
                "mediaType": media_type,
                "size": blob.len(),
                "digest": compute_oci_digest(blob),
            }))
            .collect::<Vec<_>>(),
    })
}

fn disk_bytes() -> Vec<u8> {
    (0..300_000u32).map(|i| (i % 239) as u8).collect()
}

fn source(addr: SocketAddr, tag: &str) -> SourceSpec {
    SourceSpec::Registry {
        image: ImageReference::parse(&format!("http://{}/vi/fedora:{}", addr, tag)).unwrap(),
        credentials: None,
        insecure_tls: false,
    }
}

#[tokio::test]
async fn pulls_the_disk_file_out_of_a_gzipped_layer() {
    let disk = disk_bytes();
    let disk_layer = gzip(&layer_tar(&[("disk/fedora-40.qcow2", disk.as_slice())]));
    let top_layer = layer_tar(&[("etc/motd", &b"hello"[..])]);

    let mut stub = StubRegistry::default();
    stub.add_blob(disk_layer.clone());
    stub.add_blob(top_layer.clone());
    let amd64 = stub.add_manifest(
        None,
        OCI_MANIFEST_MEDIA_TYPE,
        image_manifest(&[
            (OCI_LAYER_GZIP_MEDIA_TYPE, disk_layer.as_slice()),
            (OCI_LAYER_TAR_MEDIA_TYPE, top_layer.as_slice()),
        ]),
    );
    stub.add_manifest(
        Some("40"),
        OCI_INDEX_MEDIA_TYPE,
        json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX_MEDIA_TYPE,
            "manifests": [
                {"mediaType": OCI_MANIFEST_MEDIA_TYPE, "size": 1, "digest": compute_oci_digest(b"arm"),
                 "platform": {"architecture": "arm64", "os": "linux"}},
                {"mediaType": OCI_MANIFEST_MEDIA_TYPE, "size": 1, "digest": amd64,
                 "platform": {"architecture": "amd64", "os": "linux"}},
            ],
        }),
    );
    let (addr, stub) = serve(stub).await;

    let mut opened = source(addr, "40").open().await.unwrap();
    assert_eq!(opened.filename(), "fedora-40.qcow2");
    assert_eq!(opened.length(), disk.len() as u64);

    let mut pulled = Vec::new();
    opened.reader().unwrap().read_to_end(&mut pulled).await.unwrap();
    assert!(pulled == disk);

    assert_eq!(stub.scopes.lock().as_slice(), ["repository:vi/fedora:pull"]);
}

#[tokio::test]
async fn image_without_a_disk_directory_is_a_source_error() {
    let layer = layer_tar(&[("etc/motd", &b"hello"[..]), ("disk.img", &b"wrong place"[..])]);

    let mut stub = StubRegistry::default();
    stub.add_blob(layer.clone());
    stub.add_manifest(Some("nodisk"), OCI_MANIFEST_MEDIA_TYPE, image_manifest(&[(OCI_LAYER_TAR_MEDIA_TYPE, layer.as_slice())]));
    let (addr, _stub) = serve(stub).await;

    let err = source(addr, "nodisk").open().await.err().unwrap();
    assert!(matches!(err, ImportError::Source(_)), "{err:?}");
}

#[tokio::test]
async fn missing_tag_is_reported_by_the_registry() {
    let (addr, _stub) = serve(StubRegistry::default()).await;

    let err = source(addr, "missing").open().await.err().unwrap();
    assert!(matches!(err, ImportError::Registry(_)), "{err:?}");
}
