//! Layer encoding for streaming blob uploads
//!
//! The tar stream is compressed on the fly while two digests are kept: the
//! uncompressed one (the config's diff id) and the one of the bytes actually
//! sent (the blob digest).

use crate::error::{ImportError, Result};
use crate::image::LayerDescriptor;
use crate::image::manifest::{OCI_LAYER_GZIP_MEDIA_TYPE, OCI_LAYER_TAR_MEDIA_TYPE};
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

const READ_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerCompression {
    #[default]
    Gzip,
    None,
}

impl LayerCompression {
    pub fn media_type(&self) -> &'static str {
        match self {
            LayerCompression::Gzip => OCI_LAYER_GZIP_MEDIA_TYPE,
            LayerCompression::None => OCI_LAYER_TAR_MEDIA_TYPE,
        }
    }
}

impl FromStr for LayerCompression {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "gzip" => Ok(LayerCompression::Gzip),
            "none" => Ok(LayerCompression::None),
            other => Err(ImportError::Configuration(format!(
                "Unknown layer compression '{}', expected one of: gzip, none",
                other
            ))),
        }
    }
}

pub struct LayerEncoder {
    compression: LayerCompression,
    gzip: Option<GzEncoder<Vec<u8>>>,
    diff_hasher: Sha256,
    blob_hasher: Sha256,
    blob_size: u64,
}

impl LayerEncoder {
    pub fn new(compression: LayerCompression) -> Self {
        let gzip = match compression {
            LayerCompression::Gzip => Some(GzEncoder::new(Vec::new(), Compression::fast())),
            LayerCompression::None => None,
        };
        Self {
            compression,
            gzip,
            diff_hasher: Sha256::new(),
            blob_hasher: Sha256::new(),
            blob_size: 0,
        }
    }

    /// Encode one chunk of the tar stream and return the bytes to send
    pub fn encode(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        self.diff_hasher.update(chunk);
        let out = match &mut self.gzip {
            Some(encoder) => {
                encoder.write_all(chunk)?;
                std::mem::take(encoder.get_mut())
            }
            None => chunk.to_vec(),
        };
        Ok(self.emit(out))
    }

    /// Flush the compressor trailer; no more input is accepted afterwards
    pub fn finish(&mut self) -> io::Result<Bytes> {
        let out = match self.gzip.take() {
            Some(encoder) => encoder.finish()?,
            None => Vec::new(),
        };
        Ok(self.emit(out))
    }

    fn emit(&mut self, out: Vec<u8>) -> Bytes {
        self.blob_hasher.update(&out);
        self.blob_size += out.len() as u64;
        Bytes::from(out)
    }

    pub fn descriptor(&self) -> LayerDescriptor {
        LayerDescriptor {
            digest: format!("sha256:{}", hex::encode(self.blob_hasher.clone().finalize())),
            diff_id: format!("sha256:{}", hex::encode(self.diff_hasher.clone().finalize())),
            size: self.blob_size,
            media_type: self.compression.media_type().to_string(),
        }
    }
}

/// Turn a tar reader into an upload body stream; the encoder holds the digests once it ends
///
/// Compression runs on the blocking pool, one chunk at a time.
pub fn encode_stream<R>(
    reader: R,
    encoder: Arc<Mutex<LayerEncoder>>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let chunks = ReaderStream::with_capacity(reader, READ_CHUNK_SIZE);
    futures::stream::unfold(
        (chunks, encoder, false),
        |(mut chunks, encoder, finished)| async move {
            if finished {
                return None;
            }
            let (encoded, done) = match chunks.next().await {
                Some(Ok(chunk)) => {
                    let blocking = encoder.clone();
                    let encoded = run_blocking(move || blocking.lock().encode(&chunk)).await;
                    let failed = encoded.is_err();
                    (encoded, failed)
                }
                Some(Err(e)) => (Err(e), true),
                None => {
                    let blocking = encoder.clone();
                    (run_blocking(move || blocking.lock().finish()).await, true)
                }
            };
            Some((encoded, (chunks, encoder, done)))
        },
    )
}

async fn run_blocking<F>(work: F) -> io::Result<Bytes>
where
    F: FnOnce() -> io::Result<Bytes> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)?
}
