//! Streaming decompression of gzip and xz wrapped disk images
//!
//! Decoding is push based: compressed chunks are written into a
//! `flate2`/`xz2` write decoder whose output buffer is drained after every
//! chunk, the same way `LayerEncoder` drains its gzip encoder. The codec work
//! runs on the blocking pool so it never stalls the runtime threads.

use bytes::Bytes;
use flate2::write::MultiGzDecoder;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use xz2::write::XzDecoder;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Compression wrapping a source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCompression {
    Gzip,
    Xz,
}

impl SourceCompression {
    /// Recognise a compressed stream from its leading bytes
    pub fn detect(prefix: &[u8]) -> Option<Self> {
        if prefix.starts_with(GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if prefix.starts_with(XZ_MAGIC) {
            Some(Self::Xz)
        } else {
            None
        }
    }

    /// Match an OCI or Docker layer media type
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        if media_type.ends_with("+gzip") || media_type.ends_with(".tar.gzip") {
            Some(Self::Gzip)
        } else if media_type.ends_with("+xz") {
            Some(Self::Xz)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Xz => "xz",
        }
    }
}

enum Codec {
    Gzip(MultiGzDecoder<Vec<u8>>),
    Xz(XzDecoder<Vec<u8>>),
}

impl Codec {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Codec::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Codec::Xz(decoder) => {
                decoder.write_all(chunk)?;
                decoder.flush()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            Codec::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            Codec::Xz(decoder) => decoder.finish(),
        }
    }
}

/// Cloneable handle to a decoder whose work runs on the blocking pool
#[derive(Clone)]
pub struct StreamDecoder {
    compression: SourceCompression,
    codec: Arc<Mutex<Option<Codec>>>,
}

impl StreamDecoder {
    pub fn new(compression: SourceCompression) -> Self {
        let codec = match compression {
            SourceCompression::Gzip => Codec::Gzip(MultiGzDecoder::new(Vec::new())),
            SourceCompression::Xz => Codec::Xz(XzDecoder::new(Vec::new())),
        };
        Self {
            compression,
            codec: Arc::new(Mutex::new(Some(codec))),
        }
    }

    pub fn compression(&self) -> SourceCompression {
        self.compression
    }

    /// Decode one compressed chunk; the output may be empty
    pub async fn decode(&self, chunk: Bytes) -> io::Result<Bytes> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || match codec.lock().as_mut() {
            Some(codec) => codec.write_chunk(&chunk).map(Bytes::from),
            None => Err(io::Error::other("decoder already finished")),
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Flush the decoder and check the stream trailer
    pub async fn finish(&self) -> io::Result<Bytes> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || match codec.lock().take() {
            Some(mut codec) => codec.finish().map(Bytes::from),
            None => Ok(Bytes::new()),
        })
        .await
        .map_err(io::Error::other)?
    }
}

/// Decode a stream of compressed chunks into a stream of plain chunks
pub fn decode_stream<S>(chunks: S, decoder: StreamDecoder) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    futures::stream::unfold((chunks, decoder, false), |(mut chunks, decoder, done)| async move {
        if done {
            return None;
        }
        let (decoded, ended) = match chunks.next().await {
            Some(Ok(chunk)) => (decoder.decode(chunk).await, false),
            Some(Err(e)) => (Err(e), true),
            None => (decoder.finish().await, true),
        };
        let done = ended || decoded.is_err();
        Some((decoded, (chunks, decoder, done)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use std::io::Read;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::GzEncoder::new(data, Compression::fast())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn xz(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        xz2::read::XzEncoder::new(data, 1).read_to_end(&mut out).unwrap();
        out
    }

    fn sample() -> Vec<u8> {
        (0..300_000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn decode_all(compressed: Vec<u8>, chunk_size: usize) -> io::Result<Vec<u8>> {
        let compression = SourceCompression::detect(&compressed).unwrap();
        let chunks: Vec<io::Result<Bytes>> = compressed
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut decoded = std::pin::pin!(decode_stream(futures::stream::iter(chunks), StreamDecoder::new(compression)));
        let mut out = Vec::new();
        while let Some(chunk) = decoded.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[test]
    fn detects_magic_bytes() {
        assert_eq!(SourceCompression::detect(&gzip(b"x")), Some(SourceCompression::Gzip));
        assert_eq!(SourceCompression::detect(&xz(b"x")), Some(SourceCompression::Xz));
        assert_eq!(SourceCompression::detect(b"QFI\xfb"), None);
        assert_eq!(SourceCompression::detect(&[0x1f]), None);
    }

    #[test]
    fn maps_layer_media_types() {
        assert_eq!(
            SourceCompression::from_media_type("application/vnd.oci.image.layer.v1.tar+gzip"),
            Some(SourceCompression::Gzip)
        );
        assert_eq!(
            SourceCompression::from_media_type("application/vnd.docker.image.rootfs.diff.tar.gzip"),
            Some(SourceCompression::Gzip)
        );
        assert_eq!(SourceCompression::from_media_type("application/vnd.oci.image.layer.v1.tar"), None);
    }

    #[tokio::test]
    async fn gzip_chunks_decode_to_the_original_bytes() {
        let data = sample();
        assert_eq!(decode_all(gzip(&data), 4096).await.unwrap(), data);
    }

    #[tokio::test]
    async fn xz_chunks_decode_to_the_original_bytes() {
        let data = sample();
        assert_eq!(decode_all(xz(&data), 1000).await.unwrap(), data);
    }

    #[tokio::test]
    async fn truncated_gzip_fails_at_the_end_of_the_stream() {
        let mut compressed = gzip(&sample());
        compressed.truncate(compressed.len() / 2);
        assert!(decode_all(compressed, 4096).await.is_err());
    }
}
