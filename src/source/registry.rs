//! Container registry source
//!
//! A container disk image carries the disk file under `disk/` in one of its
//! layers. The layers are searched from the top of the image down; the first
//! regular file found under `disk/` is streamed straight out of the blob.

use crate::error::{ImportError, Result};
use crate::image::compression::{SourceCompression, StreamDecoder, decode_stream};
use crate::registry::{AccessScope, Credentials, ImageReference, RegistryClient};
use crate::source::{DataSource, SourceReader, taken_reader_error};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

/// Prefix accepted in front of registry source endpoints
pub const DOCKER_SCHEME_PREFIX: &str = "docker://";

const DISK_DIR: &str = "disk/";
const BLOCK_SIZE: u64 = 512;
/// Upper bound for GNU long-name and PAX header payloads
const MAX_EXTENDED_HEADER: u64 = 64 * 1024;

type LayerReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

pub struct RegistryDataSource {
    reader: Option<SourceReader>,
    filename: String,
    length: u64,
}

impl RegistryDataSource {
    pub async fn open(image: ImageReference, credentials: Option<Credentials>, insecure_tls: bool) -> Result<Self> {
        let client = RegistryClient::builder(image.clone())
            .with_credentials(credentials)
            .with_skip_tls(insecure_tls)
            .with_access(AccessScope::Pull)
            .build()?;

        let manifest = client.fetch_manifest().await?;
        for layer in manifest.layers.iter().rev() {
            let response = client.fetch_blob(&layer.digest).await?;
            let mut reader = layer_reader(response.bytes_stream(), &layer.media_type);

            if let Some(entry) = find_disk_entry(&mut reader).await? {
                info!(
                    image = %image,
                    layer = %layer.digest,
                    filename = %entry.filename,
                    length = entry.size,
                    "Opened registry source"
                );
                return Ok(Self {
                    reader: Some(Box::new(reader.take(entry.size))),
                    filename: entry.filename,
                    length: entry.size,
                });
            }
            debug!(layer = %layer.digest, "Layer holds no disk image");
        }

        Err(ImportError::Source(format!("{} has no file under {}", image, DISK_DIR)))
    }
}

impl DataSource for RegistryDataSource {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn reader(&mut self) -> Result<SourceReader> {
        self.reader.take().ok_or_else(taken_reader_error)
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// Plain tar bytes of a layer blob, decompressed according to its media type
fn layer_reader<S>(body: S, media_type: &str) -> LayerReader
where
    S: futures::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let chunks = body.map_err(io::Error::other).boxed();
    let chunks = match SourceCompression::from_media_type(media_type) {
        Some(compression) => decode_stream(chunks, StreamDecoder::new(compression)).boxed(),
        None => chunks,
    };
    StreamReader::new(chunks)
}

#[derive(Debug, PartialEq, Eq)]
struct DiskEntry {
    filename: String,
    size: u64,
}

/// Walk tar headers until a regular file under `disk/`; the reader is left at its data
async fn find_disk_entry<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<DiskEntry>> {
    let mut long_name: Option<String> = None;
    let mut block = [0u8; BLOCK_SIZE as usize];

    loop {
        match reader.read_exact(&mut block).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if block.iter().all(|b| *b == 0) {
            return Ok(None);
        }

        let header = tar::Header::from_byte_slice(&block);
        if !checksum_matches(&block, header) {
            return Err(ImportError::Source("Layer is not a valid tar archive".to_string()));
        }
        let size = header
            .entry_size()
            .map_err(|e| ImportError::Source(format!("Invalid tar entry size: {}", e)))?;
        let entry_type = header.entry_type();

        if entry_type.is_gnu_longname() || entry_type.is_pax_local_extensions() {
            if size > MAX_EXTENDED_HEADER {
                return Err(ImportError::Source(format!(
                    "Tar extended header of {} bytes is too large",
                    size
                )));
            }
            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data).await?;
            skip(reader, padding(size)).await?;
            if entry_type.is_gnu_longname() {
                let name = data.split(|b| *b == 0).next().unwrap_or_default();
                long_name = Some(String::from_utf8_lossy(name).into_owned());
            } else if let Some(path) = pax_path(&data) {
                long_name = Some(path);
            }
            continue;
        }

        let path = long_name
            .take()
            .unwrap_or_else(|| String::from_utf8_lossy(&header.path_bytes()).into_owned());
        if entry_type.is_file() {
            if let Some(filename) = disk_file_name(&path) {
                return Ok(Some(DiskEntry { filename, size }));
            }
        }
        skip(reader, size + padding(size)).await?;
    }
}

fn checksum_matches(block: &[u8], header: &tar::Header) -> bool {
    let Ok(expected) = header.cksum() else {
        return false;
    };
    let sum: u32 = block[..148]
        .iter()
        .chain([b' '; 8].iter())
        .chain(block[156..].iter())
        .map(|b| u32::from(*b))
        .sum();
    sum == expected
}

fn padding(size: u64) -> u64 {
    (BLOCK_SIZE - size % BLOCK_SIZE) % BLOCK_SIZE
}

async fn skip<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<()> {
    let skipped = tokio::io::copy(&mut reader.take(len), &mut tokio::io::sink()).await?;
    if skipped != len {
        return Err(ImportError::Source("Layer tar archive is truncated".to_string()));
    }
    Ok(())
}

/// `path` record of a PAX extended header
fn pax_path(data: &[u8]) -> Option<String> {
    let mut rest = data;
    let mut path = None;
    while !rest.is_empty() {
        let space = rest.iter().position(|b| *b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        if len <= space + 1 || len > rest.len() {
            return None;
        }
        if let Some(value) = rest[space + 1..len - 1].strip_prefix(b"path=") {
            path = Some(String::from_utf8_lossy(value).into_owned());
        }
        rest = &rest[len..];
    }
    path
}

/// File name of a direct child of `disk/`
fn disk_file_name(path: &str) -> Option<String> {
    let name = path.trim_start_matches("./").strip_prefix(DISK_DIR)?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn dir(builder: &mut tar::Builder<Vec<u8>>, path: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_entry_type(tar::EntryType::Directory);
        builder.append_data(&mut header, path, std::io::empty()).unwrap();
    }

    #[tokio::test]
    async fn finds_the_disk_file_after_other_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "etc/os-release", b"ID=fedora\n");
        dir(&mut builder, "disk");
        append(&mut builder, "disk/fedora.qcow2", b"QFI\xfbdisk-bytes");
        let archive = builder.into_inner().unwrap();

        let mut reader = archive.as_slice();
        let entry = find_disk_entry(&mut reader).await.unwrap().unwrap();
        assert_eq!(
            entry,
            DiskEntry {
                filename: "fedora.qcow2".to_string(),
                size: 14
            }
        );

        let mut data = Vec::new();
        (&mut reader).take(entry.size).read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"QFI\xfbdisk-bytes");
    }

    #[tokio::test]
    async fn long_disk_file_names_are_followed() {
        let name = format!("disk/{}.img", "n".repeat(150));
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, &name, b"raw");
        let archive = builder.into_inner().unwrap();

        let entry = find_disk_entry(&mut archive.as_slice()).await.unwrap().unwrap();
        assert_eq!(entry.filename, format!("{}.img", "n".repeat(150)));
        assert_eq!(entry.size, 3);
    }

    #[tokio::test]
    async fn archive_without_disk_directory_yields_nothing() {
        let mut builder = tar::Builder::new(Vec::new());
        append(&mut builder, "disk.img", b"not in disk/");
        append(&mut builder, "disk/nested/inner.img", b"too deep");
        let archive = builder.into_inner().unwrap();

        assert!(find_disk_entry(&mut archive.as_slice()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_not_a_tar_archive() {
        let garbage = vec![0x5au8; 2048];
        let err = find_disk_entry(&mut garbage.as_slice()).await.unwrap_err();
        assert!(matches!(err, ImportError::Source(_)));
    }

    #[test]
    fn pax_records() {
        let record = "25 path=disk/image.qcow2\n";
        assert_eq!(record.len(), 25);
        let data = format!("20 mtime=1700000000\n{}", record);
        assert_eq!(pax_path(data.as_bytes()), Some("disk/image.qcow2".to_string()));
        assert_eq!(pax_path(b"99 path=x\n"), None);
    }

    #[test]
    fn disk_file_names() {
        assert_eq!(disk_file_name("disk/a.img"), Some("a.img".to_string()));
        assert_eq!(disk_file_name("./disk/a.img"), Some("a.img".to_string()));
        assert_eq!(disk_file_name("disk/"), None);
        assert_eq!(disk_file_name("rootfs/disk/a.img"), None);
    }
}
